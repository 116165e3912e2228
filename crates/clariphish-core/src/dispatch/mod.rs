//! Campaign dispatch - template rendering and delivery through the campaign relay

mod engine;
mod mailer;
mod template;

pub use engine::{DispatchEngine, DispatchReport};
pub use mailer::{Mailer, OutgoingEmail, SmtpMailer};
pub use template::{Personalization, TemplateRenderer};
