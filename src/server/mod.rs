pub mod api;
pub mod websocket;

use crate::cli::Args;
use crate::history::PersistenceAdapter;
use std::error::Error;
use std::sync::Arc;

pub struct Server {
    addr: String,
    adapter: Arc<dyn PersistenceAdapter>,
    api_key: Option<String>,
    args: Args,
}

impl Server {
    pub fn new(
        addr: String,
        adapter: Arc<dyn PersistenceAdapter>,
        api_key: Option<String>,
        args: Args
    ) -> Self {
        Self {
            addr,
            adapter,
            api_key,
            args,
        }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(http_port) = self.args.http_port {
            api::start_http_server(http_port, Arc::clone(&self.adapter), self.args.clone()).await?;
        }

        websocket::start_ws_server(
            &self.addr,
            Arc::clone(&self.adapter),
            self.api_key.clone(),
            self.args.clone()
        ).await
    }
}
