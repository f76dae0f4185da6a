use anyhow::{Context, Result};
use owo_colors::OwoColorize;

use crate::args::NatsArgs;

impl NatsArgs {
    pub async fn connect(&self) -> Result<async_nats::Client> {
        println!(
            "{}{}",
            "🔌 Connecting to NATS • url=".green(),
            self.nats_url.green().dimmed(),
        );
        async_nats::ConnectOptions::new()
            .user_and_password(self.nats_user.clone(), self.nats_password.clone())
            .connect(&self.nats_url)
            .await
            .context("Failed to connect to NATS")
    }
}
