use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use strand_core::error::{Result, StrandError};
use strand_core::traits::{CapabilityClient, CompletionRequest, RetrievalRequest, ToolCall};

enum ToolBehavior {
    Reply(Value),
    Fail(String),
    Slow(Duration, Value),
}

/// A `CapabilityClient` that answers from scripts and records every call.
///
/// Completions are served FIFO; once the queue is empty the default answer
/// (initially empty) is returned. Unknown tools and pipelines fail with
/// `StrandError::Resolution`, like a real tenant-scoped resolver.
pub struct ScriptedCapabilities {
    completions: Mutex<VecDeque<String>>,
    default_completion: Mutex<String>,
    tools: Mutex<HashMap<String, ToolBehavior>>,
    pipelines: Mutex<HashMap<String, Vec<Value>>>,
    seen_completions: Mutex<Vec<CompletionRequest>>,
    seen_tool_calls: Mutex<Vec<ToolCall>>,
}

impl ScriptedCapabilities {
    pub fn new() -> Self {
        Self {
            completions: Mutex::new(VecDeque::new()),
            default_completion: Mutex::new(String::new()),
            tools: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
            seen_completions: Mutex::new(Vec::new()),
            seen_tool_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_completion(&self, text: impl Into<String>) {
        self.completions.lock().unwrap().push_back(text.into());
    }

    pub fn set_default_completion(&self, text: impl Into<String>) {
        *self.default_completion.lock().unwrap() = text.into();
    }

    pub fn set_tool(&self, tool_id: impl Into<String>, reply: Value) {
        self.tools
            .lock()
            .unwrap()
            .insert(tool_id.into(), ToolBehavior::Reply(reply));
    }

    pub fn set_failing_tool(&self, tool_id: impl Into<String>, message: impl Into<String>) {
        self.tools
            .lock()
            .unwrap()
            .insert(tool_id.into(), ToolBehavior::Fail(message.into()));
    }

    /// A tool that sleeps before answering `{}`.
    pub fn set_slow_tool(&self, tool_id: impl Into<String>, delay: Duration) {
        self.tools
            .lock()
            .unwrap()
            .insert(tool_id.into(), ToolBehavior::Slow(delay, Value::Object(Default::default())));
    }

    pub fn set_retrieval(&self, pipeline_id: impl Into<String>, hits: Vec<Value>) {
        self.pipelines.lock().unwrap().insert(pipeline_id.into(), hits);
    }

    pub fn completions(&self) -> Vec<CompletionRequest> {
        self.seen_completions.lock().unwrap().clone()
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.seen_tool_calls.lock().unwrap().clone()
    }
}

impl Default for ScriptedCapabilities {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityClient for ScriptedCapabilities {
    fn complete(&self, req: CompletionRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.seen_completions.lock().unwrap().push(req);
            let next = self.completions.lock().unwrap().pop_front();
            Ok(next.unwrap_or_else(|| self.default_completion.lock().unwrap().clone()))
        })
    }

    fn call_tool(&self, call: ToolCall) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let tool_id = call.tool_id.clone();
            self.seen_tool_calls.lock().unwrap().push(call);
            let behavior = {
                let tools = self.tools.lock().unwrap();
                match tools.get(&tool_id) {
                    None => None,
                    Some(ToolBehavior::Reply(v)) => Some(Ok((None, v.clone()))),
                    Some(ToolBehavior::Fail(m)) => Some(Err(m.clone())),
                    Some(ToolBehavior::Slow(d, v)) => Some(Ok((Some(*d), v.clone()))),
                }
            };
            match behavior {
                None => Err(StrandError::Resolution(format!("tool '{}' not found", tool_id))),
                Some(Err(message)) => Err(StrandError::node(tool_id, message)),
                Some(Ok((delay, value))) => {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(value)
                }
            }
        })
    }

    fn retrieve(&self, req: RetrievalRequest) -> BoxFuture<'_, Result<Vec<Value>>> {
        Box::pin(async move {
            let pipelines = self.pipelines.lock().unwrap();
            let hits = pipelines.get(&req.pipeline_id).ok_or_else(|| {
                StrandError::Resolution(format!("pipeline '{}' not found", req.pipeline_id))
            })?;
            Ok(hits.iter().take(req.top_k).cloned().collect())
        })
    }
}
