/*
 * SPDX-FileCopyrightText: 2025 Wavelens UG <info@wavelens.io>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::types::Cli;
use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use regex::Regex;
use tokio::fs;
use tracing::{info, warn};

/// Where package and discard notifications go.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, subject: &str, body: &str, recipients: &[String]) -> Result<()>;
}

pub struct EmailService {
    transport: Option<SmtpTransport>,
    from_address: String,
    from_name: String,
    allow: Regex,
    enabled: bool,
}

impl EmailService {
    pub async fn new(cli: &Cli) -> Result<Self> {
        let allow = Regex::new(&cli.email_allow_regex)
            .with_context(|| format!("Invalid email allow regex '{}'", cli.email_allow_regex))?;

        if !cli.email_enabled {
            return Ok(Self {
                transport: None,
                from_address: String::new(),
                from_name: cli.email_from_name.clone(),
                allow,
                enabled: false,
            });
        }

        let smtp_host = cli
            .email_smtp_host
            .as_ref()
            .context("SMTP host is required when email is enabled")?;

        let from_address = cli
            .email_from_address
            .as_ref()
            .context("From address is required when email is enabled")?;

        let credentials = match (&cli.email_smtp_username, &cli.email_smtp_password_file) {
            (Some(username), Some(password_file)) => {
                let password = fs::read_to_string(password_file)
                    .await
                    .context("Failed to read SMTP password file")?
                    .trim()
                    .to_string();
                Some(Credentials::new(username.clone(), password))
            }
            _ => None,
        };

        let mut builder = if cli.email_disable_tls {
            SmtpTransport::builder_dangerous(smtp_host)
        } else {
            SmtpTransport::relay(smtp_host).context("Failed to create SMTP transport")?
        };
        builder = builder.port(cli.email_smtp_port);
        if let Some(credentials) = credentials {
            builder = builder.credentials(credentials);
        }

        Ok(Self {
            transport: Some(builder.build()),
            from_address: from_address.clone(),
            from_name: cli.email_from_name.clone(),
            allow,
            enabled: true,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Recipients that pass the allow regex, without duplicates.
    pub fn allowed(&self, recipients: &[String]) -> Vec<String> {
        let mut result: Vec<String> = Vec::new();
        for address in recipients {
            let address = address.trim();
            if address.is_empty() || result.iter().any(|r| r == address) {
                continue;
            }
            if self.allow.is_match(address) {
                result.push(address.to_string());
            } else {
                warn!(address = %address, "Notification address not allowed (skipping)");
            }
        }
        result
    }
}

#[async_trait]
impl NotificationSink for EmailService {
    async fn notify(&self, subject: &str, body: &str, recipients: &[String]) -> Result<()> {
        let recipients = self.allowed(recipients);
        let Some(transport) = self.transport.as_ref().filter(|_| self.enabled) else {
            info!(subject = %subject, "Email disabled, notification not sent");
            return Ok(());
        };
        if recipients.is_empty() {
            info!(subject = %subject, "No recipients for notification");
            return Ok(());
        }

        for to in recipients {
            let email = Message::builder()
                .from(
                    format!("{} <{}>", self.from_name, self.from_address)
                        .parse()
                        .context("Invalid from address")?,
                )
                .to(to.parse().context("Invalid to address")?)
                .subject(subject)
                .header(ContentType::TEXT_PLAIN)
                .body(body.to_string())
                .context("Failed to build email")?;

            match transport.send(&email) {
                Ok(_) => info!(to = %to, subject = %subject, "Notification sent"),
                Err(e) => warn!(to = %to, error = %e, "Failed to send notification"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[tokio::test]
    async fn test_allow_regex_filters_recipients() {
        let cli = Cli::parse_from([
            "aptforge",
            "--email-allow-regex",
            r".*@example\.org$",
        ]);
        let service = EmailService::new(&cli).await.unwrap();
        assert!(!service.is_enabled());

        let allowed = service.allowed(&[
            "dev@example.org".to_string(),
            "spam@elsewhere.net".to_string(),
            "dev@example.org".to_string(),
        ]);
        assert_eq!(allowed, vec!["dev@example.org".to_string()]);

        service
            .notify("subject", "body", &["dev@example.org".to_string()])
            .await
            .unwrap();
    }
}
