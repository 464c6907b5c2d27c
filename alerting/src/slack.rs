//! Slack webhook alerter.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use url::Url;

use crate::{Alert, Alerter, BoxError};

const FAILURE_COLOR: &str = "#ff005f";

/// Static configuration for the Slack sink.
#[derive(Debug, Clone)]
pub struct SlackAlerterConfig {
    pub webhook_url: Url,
    /// Username the webhook posts as.
    pub username: String,
    /// Channels every failure is posted to.
    pub default_channels: Vec<String>,
    /// Additional channels per package name.
    pub custom_channels: HashMap<String, Vec<String>>,
}

/// Posts test failures to Slack via an incoming webhook.
pub struct SlackAlerter {
    client: reqwest::Client,
    config: SlackAlerterConfig,
}

impl SlackAlerter {
    pub fn new(config: SlackAlerterConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// The channels a failure in `package` is announced to.
    fn channels_for(&self, package: &str) -> impl Iterator<Item = &str> {
        self.config
            .default_channels
            .iter()
            .chain(
                self.config
                    .custom_channels
                    .get(package)
                    .into_iter()
                    .flatten(),
            )
            .map(String::as_str)
    }

    fn message(&self, alert: &Alert, channel: &str) -> WebhookMessage {
        let test = &alert.test;
        let test_link = format!("{}/tests/{}", alert.base_url, test.id);
        let duration = test.result.duration();

        WebhookMessage {
            channel: channel.to_owned(),
            username: self.config.username.clone(),
            attachments: vec![Attachment {
                color: FAILURE_COLOR.to_owned(),
                fallback: format!(
                    "{} with ID {} failed ({}s).\n{}",
                    test.result.name,
                    test.id,
                    duration.num_seconds(),
                    test_link,
                ),
                title: test.result.name.clone(),
                title_link: test_link,
                text: "Failure running test".to_owned(),
                fields: vec![
                    AttachmentField {
                        title: "Package".to_owned(),
                        value: alert.run.package.clone(),
                        short: true,
                    },
                    AttachmentField {
                        title: "Test ID".to_owned(),
                        value: test.id.to_string(),
                        short: true,
                    },
                    AttachmentField {
                        title: "Duration".to_owned(),
                        value: format!("{}s", duration.num_seconds()),
                        short: true,
                    },
                ],
                footer: self.config.username.clone(),
                ts: test.result.tb.finished_at.timestamp(),
            }],
        }
    }
}

#[async_trait]
impl Alerter for SlackAlerter {
    async fn fire(&self, alert: &Alert) -> Result<(), BoxError> {
        for channel in self.channels_for(&alert.run.package) {
            let message = self.message(alert, channel);
            let response = self
                .client
                .post(self.config.webhook_url.clone())
                .json(&message)
                .send()
                .await?;
            if let Err(err) = response.error_for_status_ref() {
                return Err(format!("firing slack alert to {channel}: {err}").into());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookMessage {
    channel: String,
    username: String,
    attachments: Vec<Attachment>,
}

#[derive(Debug, Serialize)]
struct Attachment {
    color: String,
    fallback: String,
    title: String,
    title_link: String,
    text: String,
    fields: Vec<AttachmentField>,
    footer: String,
    ts: i64,
}

#[derive(Debug, Serialize)]
struct AttachmentField {
    title: String,
    value: String,
    short: bool,
}
