//! Job lifecycle notifications
//!
//! Fire-and-forget external effects: Discord webhooks and a phone gateway.
//! Delivery failures are logged at warn and never surfaced to the caller or
//! reflected in job state. The `started` Discord message id is kept on the
//! job record so the message can be edited later (e.g. when the W&B run URL
//! turns up).

use std::time::Duration;

use anyhow::{Context, Result};
use nexus_core::domain::job::{Job, NotificationType};
use serde_json::json;

/// Lifecycle event a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Started,
    Completed,
    Failed,
    Killed,
}

impl JobAction {
    fn emoji(self) -> &'static str {
        match self {
            Self::Started => ":rocket:",
            Self::Completed => ":checkered_flag:",
            Self::Failed => ":interrobang:",
            Self::Killed => ":octagonal_sign:",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }
}

/// Key under which the started-message id is stored on the job record.
pub const DISCORD_START_MESSAGE: &str = "discord_start_job";

pub struct Notifier {
    client: reqwest::Client,
}

impl Notifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { client }
    }

    /// Dispatch notifications for a lifecycle event to every channel the job
    /// asked for. Returns an updated record when a channel handed back a
    /// message id worth remembering; errors are logged, not returned.
    pub async fn notify_job_action(&self, job: &Job, action: JobAction) -> Job {
        let mut updated = job.clone();

        for channel in &job.notifications {
            let result = match channel {
                NotificationType::Discord => self.send_discord(&mut updated, action).await,
                NotificationType::Phone => self.send_phone(&updated, action).await,
            };
            if let Err(e) = result {
                tracing::warn!(
                    "Failed to send {} notification for job {}: {e:#}",
                    channel.as_str(),
                    job.id
                );
            }
        }

        updated
    }

    /// Edit the started Discord message to carry the discovered W&B URL.
    pub async fn update_notification_with_wandb(&self, job: &Job) -> Result<()> {
        let webhook_url = discord_webhook(job)?;
        let message_id = job
            .notification_messages
            .get(DISCORD_START_MESSAGE)
            .context("no started-message id recorded for this job")?;

        let body = discord_message(job, JobAction::Started)?;
        let edit_url = format!("{webhook_url}/messages/{message_id}");

        let response = self
            .client
            .patch(&edit_url)
            .json(&body)
            .send()
            .await
            .context("Discord edit request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Discord edit returned {}", response.status());
        }
        Ok(())
    }

    async fn send_discord(&self, job: &mut Job, action: JobAction) -> Result<()> {
        let webhook_url = discord_webhook(job)?;
        let mut body = discord_message(job, action)?;

        // Terminal failures carry the tail of the log for quick triage.
        if matches!(action, JobAction::Failed | JobAction::Killed) {
            if let Some(dir) = job.dir.as_deref() {
                if let Ok(Some(tail)) = crate::engine::read_logs(dir, Some(20)) {
                    if let Some(fields) = body["embeds"][0]["fields"].as_array_mut() {
                        fields.push(json!({
                            "name": "Last log lines",
                            "value": format!("```\n{tail}\n```"),
                        }));
                    }
                }
            }
        }

        // The started message is sent with wait=true so Discord returns the
        // message object; its id is what makes later edits possible.
        let wait = action == JobAction::Started;
        let response = self
            .client
            .post(&webhook_url)
            .query(&[("wait", if wait { "true" } else { "false" })])
            .json(&body)
            .send()
            .await
            .context("Discord webhook request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Discord webhook returned {}", response.status());
        }

        if wait {
            let message: serde_json::Value =
                response.json().await.context("Invalid Discord response")?;
            if let Some(id) = message.get("id").and_then(|v| v.as_str()) {
                job.notification_messages
                    .insert(DISCORD_START_MESSAGE.to_string(), id.to_string());
            }
        }

        Ok(())
    }

    async fn send_phone(&self, job: &Job, action: JobAction) -> Result<()> {
        let gateway = job
            .env
            .get("PHONE_GATEWAY_URL")
            .context("missing PHONE_GATEWAY_URL in job environment")?;
        let to_number = job
            .env
            .get("PHONE_TO_NUMBER")
            .context("missing PHONE_TO_NUMBER in job environment")?;

        let body = json!({
            "to": to_number,
            "message": format!(
                "Nexus job {} {} on {} (GPUs {:?})",
                job.id,
                action.label(),
                job.node_name,
                job.gpu_idxs
            ),
        });

        let response = self
            .client
            .post(gateway)
            .json(&body)
            .send()
            .await
            .context("Phone gateway request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Phone gateway returned {}", response.status());
        }
        Ok(())
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

fn discord_webhook(job: &Job) -> Result<String> {
    job.env
        .get("DISCORD_WEBHOOK_URL")
        .cloned()
        .context("missing DISCORD_WEBHOOK_URL in job environment")
}

fn discord_message(job: &Job, action: JobAction) -> Result<serde_json::Value> {
    let user_id = job
        .env
        .get("DISCORD_USER_ID")
        .context("missing DISCORD_USER_ID in job environment")?;

    let wandb = match (&job.wandb_url, action) {
        (Some(url), _) => url.clone(),
        (None, JobAction::Started) => "Pending ...".to_string(),
        (None, _) => "Not found".to_string(),
    };

    let mut fields = vec![
        json!({"name": "Command", "value": job.command}),
        json!({"name": "W&B", "value": wandb}),
        json!({
            "name": "Git",
            "value": format!("{} ({}) - Branch: {}", job.git_tag, job.git_repo_url, job.git_branch),
        }),
        json!({"name": "User", "value": job.user, "inline": true}),
        json!({"name": "GPUs", "value": format!("{:?}", job.gpu_idxs), "inline": true}),
        json!({"name": "Node", "value": job.node_name, "inline": true}),
    ];
    if let Some(error) = &job.error_message {
        if matches!(action, JobAction::Completed | JobAction::Failed) {
            fields.insert(1, json!({"name": "Error", "value": error}));
        }
    }

    Ok(json!({
        "content": format!(
            "{} - **Job {} {} on GPUs {:?}** - <@{}>",
            action.emoji(), job.id, action.label(), job.gpu_idxs, user_id
        ),
        "username": "Nexus",
        "embeds": [{
            "fields": fields,
            "color": 4_915_310,
            "footer": {"text": format!("Job Status Update - {}", job.id)},
        }],
    }))
}
