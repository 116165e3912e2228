//! Template Renderer - personalizes campaign email for one recipient

use crate::html::insert_before_body_close;
use clariphish_common::{Error, Result};
use clariphish_storage::models::Recipient;
use regex::Regex;

/// Substitution values for a single recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Personalization {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub position: String,
    pub rid: String,
    /// Click URL, the link recipients are lured into following
    pub url: String,
    /// Open pixel URL
    pub tracking_url: String,
    /// Report-phishing URL
    pub report_url: String,
}

impl Personalization {
    /// Build the values for `recipient` against the campaign base URL
    pub fn new(recipient: &Recipient, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let rid = recipient.token.as_str();
        Self {
            first_name: recipient.first_name.clone(),
            last_name: recipient.last_name.clone(),
            email: recipient.email.clone(),
            position: recipient.position.clone(),
            rid: rid.to_string(),
            url: format!("{}/click?rid={}", base, rid),
            tracking_url: format!("{}/track?rid={}", base, rid),
            report_url: format!("{}/report-phishing?rid={}", base, rid),
        }
    }

    fn pairs(&self) -> [(&'static str, &str); 8] {
        [
            ("{{.FirstName}}", self.first_name.as_str()),
            ("{{.LastName}}", self.last_name.as_str()),
            ("{{.Email}}", self.email.as_str()),
            ("{{.Position}}", self.position.as_str()),
            ("{{.RId}}", self.rid.as_str()),
            ("{{.URL}}", self.url.as_str()),
            ("{{.TrackingURL}}", self.tracking_url.as_str()),
            ("{{.ReportURL}}", self.report_url.as_str()),
        ]
    }
}

/// Template renderer for campaign email
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    leftover: Regex,
}

impl TemplateRenderer {
    pub fn new() -> Result<Self> {
        let leftover = Regex::new(r"\{\{[^}]+\}\}")
            .map_err(|e| Error::Internal(format!("Invalid placeholder pattern: {}", e)))?;
        Ok(Self { leftover })
    }

    /// Substitute known placeholders and drop unknown ones
    pub fn render(&self, template: &str, values: &Personalization) -> String {
        let mut result = template.to_string();
        for (placeholder, value) in values.pairs() {
            result = result.replace(placeholder, value);
        }
        self.leftover.replace_all(&result, "").into_owned()
    }

    /// Render an HTML body and add the open pixel
    pub fn render_html(&self, template: &str, values: &Personalization) -> String {
        let body = self.render(template, values);
        let pixel = format!(
            r#"<img alt="" style="display: none" src="{}"/>"#,
            values.tracking_url
        );
        insert_before_body_close(&body, &pixel)
    }
}
