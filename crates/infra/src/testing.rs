//! Shared fakes for unit and scenario tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::delivery::{DeliveryClient, DeliveryError};

/// What the fake endpoint does with one request.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Accept,
    Status(u16),
    Refuse,
    Hang,
    Panic,
}

/// Delivery client that records every call and answers from a script.
#[derive(Debug)]
pub(crate) struct ScriptedClient {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedClient {
    pub(crate) fn always(reply: Reply) -> Self {
        Self::scripted([], reply)
    }

    pub(crate) fn scripted(script: impl IntoIterator<Item = Reply>, fallback: Reply) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl DeliveryClient for ScriptedClient {
    async fn post(
        &self,
        url: &str,
        _headers: &BTreeMap<String, String>,
        body: String,
    ) -> Result<u16, DeliveryError> {
        self.calls.lock().unwrap().push((url.to_string(), body));
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match reply {
            Reply::Accept => Ok(200),
            Reply::Status(code) => Err(DeliveryError::Status {
                code,
                message: "scripted".to_string(),
            }),
            Reply::Refuse => Err(DeliveryError::Transport("connection refused".to_string())),
            Reply::Hang => std::future::pending().await,
            Reply::Panic => panic!("endpoint handler blew up"),
        }
    }
}
