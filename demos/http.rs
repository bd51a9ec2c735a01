use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use stampede::{ci_run, Attack, AttackConfig, AttackError, DoResult, LoadManager};

/// GET one URL per call. The URL comes from the handle's `handle_params`.
struct HttpGet {
    client: Client,
    url: String,
}

impl HttpGet {
    fn new() -> Self {
        // NEVER build the client inside do_attack unless you want to kill
        // performance; clones share its connection pool.
        Self {
            client: Client::new(),
            url: String::new(),
        }
    }
}

#[async_trait]
impl Attack for HttpGet {
    async fn setup(
        &mut self,
        _manager: Arc<LoadManager>,
        config: &AttackConfig,
    ) -> Result<(), AttackError> {
        self.url = config
            .handle_params
            .get("url")
            .cloned()
            .unwrap_or_else(|| "http://localhost:3000".to_string());
        Ok(())
    }

    async fn do_attack(&mut self) -> DoResult {
        match self.client.get(&self.url).send().await {
            Ok(response) => DoResult::labeled("get").with_status(response.status().as_u16()),
            Err(err) => {
                DoResult::labeled("get").with_error(AttackError::Other(err.to_string()))
            }
        }
    }

    async fn teardown(&mut self) -> Result<(), AttackError> {
        Ok(())
    }

    fn clone_attack(&self) -> Box<dyn Attack> {
        Box::new(Self {
            client: self.client.clone(),
            url: self.url.clone(),
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().init();
    ci_run(|_handle| Box::new(HttpGet::new()) as Box<dyn Attack>).await
}
