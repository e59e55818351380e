use std::sync::Mutex;

use futures::future::BoxFuture;

use strand_core::error::Result;
use strand_core::traits::TokenBroker;

/// Mints `<prefix>:<grant>:<scope,scope>` and remembers each request.
pub struct StaticTokenBroker {
    prefix: String,
    minted: Mutex<Vec<(String, Vec<String>, Option<String>)>>,
}

impl StaticTokenBroker {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            minted: Mutex::new(Vec::new()),
        }
    }

    /// `(grant_id, scopes, audience)` per mint call.
    pub fn minted(&self) -> Vec<(String, Vec<String>, Option<String>)> {
        self.minted.lock().unwrap().clone()
    }
}

impl TokenBroker for StaticTokenBroker {
    fn mint(
        &self,
        grant_id: &str,
        scopes: Vec<String>,
        audience: Option<String>,
    ) -> BoxFuture<'_, Result<String>> {
        let token = format!("{}:{}:{}", self.prefix, grant_id, scopes.join(","));
        self.minted
            .lock()
            .unwrap()
            .push((grant_id.to_string(), scopes, audience));
        Box::pin(async move { Ok(token) })
    }
}
