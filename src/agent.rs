use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::llm::{
    complete_with_retry, ChatBackend, ChatMessage, ChatRequest, LlmConfig, RetryPolicy,
    ToolCallRequest, Usage,
};
use crate::schema::{parse_structured, tool_schema};

// ========================= Tools =========================

/// One model-callable operation. Handlers never fail at the trait level:
/// failures come back as `{"error": ...}` payloads so the loop can feed
/// them to the model as ordinary conversation content.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value) -> Value;
}

#[derive(Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments; used both on the wire and to
    /// validate model-issued calls before execution.
    pub parameters: Value,
    pub handler: Arc<dyn ToolHandler>,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler,
        }
    }
}

/// Hook points around every executed tool call. The plain agent installs
/// none; the streaming supervisor uses these for telemetry and the pause
/// gates. Either hook may suspend the run until an external resume.
#[async_trait]
pub trait ToolSupervisor: Send + Sync {
    async fn before_tool(&self, name: &str, args: &Value);
    async fn after_tool(&self, name: &str, args: &Value, result: &Value);
}

// ========================= Results =========================

#[derive(Clone, Debug, Serialize)]
pub struct AgentResult {
    pub output: Option<Value>,
    pub usage: Usage,
    pub iterations: usize,
    pub success: bool,
    pub error: Option<String>,
}

impl Default for AgentResult {
    fn default() -> Self {
        Self {
            output: None,
            usage: Usage::default(),
            iterations: 0,
            success: true,
            error: None,
        }
    }
}

impl AgentResult {
    pub fn output_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.output
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

// ========================= Configuration =========================

#[derive(Clone)]
pub struct AgentConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub max_iterations: usize,
    /// Transcript cap for pruning; the system message always survives.
    pub history_limit: usize,
    pub retry: RetryPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: LlmConfig::default().model,
            temperature: 0.7,
            max_tokens: None,
            max_iterations: 50,
            history_limit: 20,
            retry: RetryPolicy::default(),
        }
    }
}

/// Cooperative cancellation token. Observed at the top of each loop
/// iteration; an in-flight model call or tool execution runs to
/// completion first. Safe to trigger repeatedly or after the run ended.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ========================= Agent Core =========================

pub struct Agent {
    backend: Arc<dyn ChatBackend>,
    system_prompt: String,
    tools: Vec<Tool>,
    response_schema: Option<Value>,
    supervisor: Option<Arc<dyn ToolSupervisor>>,
    cfg: AgentConfig,
    messages: Vec<ChatMessage>,
    stop_requested: Arc<AtomicBool>,
}

impl Agent {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        system_prompt: impl Into<String>,
        cfg: AgentConfig,
    ) -> Self {
        Self {
            backend,
            system_prompt: system_prompt.into(),
            tools: Vec::new(),
            response_schema: None,
            supervisor: None,
            cfg,
            messages: Vec::new(),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_supervisor(mut self, supervisor: Arc<dyn ToolSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop_requested.clone())
    }

    /// Full transcript, kept after the run for callers that persist it.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    fn init_messages(&mut self) {
        let mut system = self.system_prompt.clone();
        if let Some(schema) = &self.response_schema {
            let rendered = serde_json::to_string_pretty(schema).unwrap_or_default();
            system.push_str("\n\nYou must respond with valid JSON matching this exact schema:\n");
            system.push_str(&rendered);
            system.push_str("\n\nReturn only the JSON object, no additional text.");
        }
        self.messages = vec![ChatMessage::system(system)];
    }

    fn prune_history(&mut self) {
        let limit = self.cfg.history_limit;
        if limit > 1 && self.messages.len() > limit {
            let keep_from = self.messages.len() - (limit - 1);
            let mut pruned = Vec::with_capacity(limit);
            pruned.push(self.messages[0].clone());
            pruned.extend(self.messages[keep_from..].iter().cloned());
            self.messages = pruned;
            debug!(len = self.messages.len(), "pruned conversation history");
        }
    }

    fn build_request(&self) -> ChatRequest {
        let tools = if self.tools.is_empty() {
            None
        } else {
            Some(
                self.tools
                    .iter()
                    .map(|t| tool_schema(&t.name, &t.description, t.parameters.clone()))
                    .collect(),
            )
        };
        let tool_choice = tools.as_ref().map(|_| "auto".to_string());
        // json_object mode conflicts with tool calling on some providers;
        // with tools present the schema is enforced by parse instead.
        let response_format = if self.response_schema.is_some() && self.tools.is_empty() {
            Some(json!({"type": "json_object"}))
        } else {
            None
        };
        ChatRequest {
            model: self.cfg.model.clone(),
            messages: self.messages.clone(),
            temperature: self.cfg.temperature,
            max_tokens: self.cfg.max_tokens,
            tools,
            tool_choice,
            response_format,
        }
    }

    /// Main execution loop. Terminates with a structured result, the raw
    /// final text, or a failure once the iteration budget runs out.
    pub async fn run(&mut self, query: &str) -> AgentResult {
        self.stop_requested.store(false, Ordering::SeqCst);
        let mut result = AgentResult::default();

        if self.messages.is_empty() {
            self.init_messages();
        }
        self.messages.push(ChatMessage::user(query));

        for iteration in 0..self.cfg.max_iterations {
            if self.stop_requested.load(Ordering::SeqCst) {
                info!("agent stopped by request");
                result.success = false;
                result.error = Some("Stopped by user".into());
                return result;
            }

            info!(
                iteration = iteration + 1,
                max = self.cfg.max_iterations,
                "agent iteration"
            );
            result.iterations = iteration + 1;
            self.prune_history();
            let request = self.build_request();

            let completion =
                match complete_with_retry(self.backend.as_ref(), &request, self.cfg.retry).await {
                    Ok(c) => c,
                    Err(err) => {
                        warn!(error = %err, "model backend unreachable");
                        result.success = false;
                        result.error = Some("API call failed".into());
                        return result;
                    }
                };
            result.usage = completion.usage.clone();

            let message = completion
                .choices
                .into_iter()
                .next()
                .map(|c| c.message)
                .unwrap_or_else(|| ChatMessage::assistant(""));
            self.messages.push(message.clone());

            let tool_calls = message.tool_calls.unwrap_or_default();
            if tool_calls.is_empty() {
                let content = message.content.unwrap_or_default();
                match &self.response_schema {
                    Some(schema) => match parse_structured(&content, schema) {
                        Ok(value) => {
                            result.output = Some(value);
                            return result;
                        }
                        Err(err) => {
                            warn!(error = %err, "structured output rejected");
                            self.messages.push(ChatMessage::user(format!(
                                "Your previous reply was not acceptable: {err}. \
                                 Respond again with only a JSON object matching the required schema."
                            )));
                            continue;
                        }
                    },
                    None => {
                        result.output = Some(Value::String(content));
                        return result;
                    }
                }
            }

            for call in &tool_calls {
                let outcome = self.dispatch_tool_call(call).await;
                self.messages.push(ChatMessage::tool(&call.id, outcome));
            }
        }

        // Budget exhausted. Try to salvage a structured result from the
        // last assistant turn before giving up.
        warn!(max = self.cfg.max_iterations, "max iterations reached");
        if let Some(schema) = &self.response_schema {
            if let Some(content) = self.last_assistant_content() {
                if let Ok(value) = parse_structured(&content, schema) {
                    info!("salvaged structured output from final assistant turn");
                    result.output = Some(value);
                    return result;
                }
            }
        }
        result.success = false;
        result.error = Some("Max iterations reached".into());
        result
    }

    async fn dispatch_tool_call(&self, call: &ToolCallRequest) -> String {
        let name = &call.function.name;
        let raw = call.function.arguments.trim();
        let args: Value = if raw.is_empty() {
            json!({})
        } else {
            match serde_json::from_str(raw) {
                Ok(v) => v,
                Err(err) => {
                    return json!({"error": format!("Invalid JSON arguments: {err}")}).to_string()
                }
            }
        };

        let Some(tool) = self.tools.iter().find(|t| t.name == *name) else {
            let available: Vec<&str> = self.tools.iter().map(|t| t.name.as_str()).collect();
            return json!({
                "error": format!("Tool '{name}' not found"),
                "available_tools": available,
            })
            .to_string();
        };

        if let Err(err) = crate::schema::validate(&args, &tool.parameters) {
            return json!({
                "error": format!(
                    "Invalid arguments for {name}: {err}. Correct the arguments and call the tool again."
                ),
            })
            .to_string();
        }

        info!(tool = %name, "executing tool");
        if let Some(sup) = &self.supervisor {
            sup.before_tool(name, &args).await;
        }
        let result = tool.handler.call(args.clone()).await;
        if let Some(sup) = &self.supervisor {
            sup.after_tool(name, &args, &result).await;
        }
        match result {
            Value::String(s) => s,
            other => other.to_string(),
        }
    }

    fn last_assistant_content(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "assistant")
            .and_then(|m| m.content.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ApiError, ChatChoice, ChatCompletion, FunctionCall};
    use crate::schema::schema_for;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    // ----- scripted backend -----

    enum Script {
        Reply(ChatCompletion),
        Fail(ApiError),
    }

    struct ScriptedBackend {
        script: Mutex<VecDeque<Script>>,
        /// When the script runs dry, keep replaying this.
        fallback: Option<ChatCompletion>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback: None,
            })
        }

        fn looping(reply: ChatCompletion) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(VecDeque::new()),
                fallback: Some(reply),
            })
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn complete(&self, _req: &ChatRequest) -> Result<ChatCompletion, ApiError> {
            match self.script.lock().await.pop_front() {
                Some(Script::Reply(c)) => Ok(c),
                Some(Script::Fail(e)) => Err(e),
                None => match &self.fallback {
                    Some(c) => Ok(c.clone()),
                    None => Err(ApiError::Network("script exhausted".into())),
                },
            }
        }
    }

    fn text_reply(text: &str) -> ChatCompletion {
        ChatCompletion {
            choices: vec![ChatChoice {
                message: ChatMessage::assistant(text),
            }],
            usage: Usage::default(),
        }
    }

    fn tool_reply(name: &str, arguments: &str) -> ChatCompletion {
        tool_reply_with_content(name, arguments, None)
    }

    fn tool_reply_with_content(
        name: &str,
        arguments: &str,
        content: Option<&str>,
    ) -> ChatCompletion {
        let message = ChatMessage {
            role: "assistant".into(),
            content: content.map(str::to_string),
            tool_calls: Some(vec![ToolCallRequest {
                id: "call_1".into(),
                kind: "function".into(),
                function: FunctionCall {
                    name: name.into(),
                    arguments: arguments.into(),
                },
            }]),
            tool_call_id: None,
        };
        ChatCompletion {
            choices: vec![ChatChoice { message }],
            usage: Usage::default(),
        }
    }

    // ----- fake tools -----

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        async fn call(&self, args: Value) -> Value {
            json!({"message": format!("typed {}", args["text"])})
        }
    }

    struct StopTool(StopHandle);

    #[async_trait]
    impl ToolHandler for StopTool {
        async fn call(&self, _args: Value) -> Value {
            self.0.stop();
            json!({"message": "stopping"})
        }
    }

    fn type_tool(handler: Arc<dyn ToolHandler>) -> Tool {
        Tool::new(
            "type",
            "Type text into a field",
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"],
            }),
            handler,
        )
    }

    fn quick_cfg(max_iterations: usize) -> AgentConfig {
        AgentConfig {
            model: "test-model".into(),
            max_iterations,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: std::time::Duration::from_millis(1),
            },
            ..AgentConfig::default()
        }
    }

    #[derive(Deserialize, JsonSchema)]
    #[allow(dead_code)]
    struct Review {
        role: String,
        score: f64,
    }

    // ----- tests -----

    #[tokio::test]
    async fn tool_turn_then_final_answer() {
        let backend = ScriptedBackend::new(vec![
            Script::Reply(tool_reply("type", r#"{"text": "hello"}"#)),
            Script::Reply(text_reply("done")),
        ]);
        let mut agent = Agent::new(backend, "You are a form filler.", quick_cfg(10))
            .with_tools(vec![type_tool(Arc::new(EchoTool))]);

        let result = agent.run("fill field X with 'hello'").await;
        assert!(result.success);
        assert_eq!(result.iterations, 2);
        assert_eq!(result.output, Some(Value::String("done".into())));
        // system, user, assistant tool call, tool result, assistant final
        assert_eq!(agent.messages().len(), 5);
        assert_eq!(agent.messages()[0].role, "system");
        assert_eq!(agent.messages()[3].role, "tool");
    }

    #[tokio::test]
    async fn malformed_output_gets_corrected_next_turn() {
        let backend = ScriptedBackend::new(vec![
            Script::Reply(text_reply(r#"{"role": "X""#)),
            Script::Reply(text_reply(r#"{"role": "X", "score": 80}"#)),
        ]);
        let mut agent = Agent::new(backend, "Parse the review.", quick_cfg(10))
            .with_response_schema(schema_for::<Review>());

        let result = agent.run("review this").await;
        assert!(result.success);
        assert_eq!(result.iterations, 2);
        let review: Review = result.output_as().unwrap();
        assert_eq!(review.role, "X");
        assert_eq!(review.score, 80.0);
        // A corrective user message sits between the two assistant turns.
        let corrective = &agent.messages()[3];
        assert_eq!(corrective.role, "user");
        assert!(corrective
            .content
            .as_deref()
            .unwrap()
            .contains("not acceptable"));
    }

    #[tokio::test]
    async fn runaway_tool_calls_hit_iteration_budget() {
        let backend = ScriptedBackend::looping(tool_reply("type", r#"{"text": "again"}"#));
        let mut agent = Agent::new(backend, "Keep going.", quick_cfg(3))
            .with_tools(vec![type_tool(Arc::new(EchoTool))]);

        let result = agent.run("loop forever").await;
        assert!(!result.success);
        assert_eq!(result.iterations, 3);
        assert_eq!(result.error.as_deref(), Some("Max iterations reached"));
    }

    #[tokio::test]
    async fn budget_exhaustion_salvages_last_assistant_turn() {
        // Every turn both answers and calls a tool, so the loop never
        // terminates on its own; the final content still fits the schema.
        let backend = ScriptedBackend::looping(tool_reply_with_content(
            "type",
            r#"{"text": "x"}"#,
            Some(r#"{"role": "X", "score": 80}"#),
        ));
        let mut agent = Agent::new(backend, "Review.", quick_cfg(2))
            .with_tools(vec![type_tool(Arc::new(EchoTool))])
            .with_response_schema(schema_for::<Review>());

        let result = agent.run("review this").await;
        assert!(result.success);
        let review: Review = result.output_as().unwrap();
        assert_eq!(review.score, 80.0);
    }

    #[tokio::test]
    async fn backend_failure_fails_the_run() {
        let backend = ScriptedBackend::new(vec![Script::Fail(ApiError::Status {
            code: 400,
            body: "bad".into(),
        })]);
        let mut agent = Agent::new(backend, "Hi.", quick_cfg(10));
        let result = agent.run("hello").await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("API call failed"));
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_result_not_failure() {
        let backend = ScriptedBackend::new(vec![
            Script::Reply(tool_reply("imaginary", r#"{}"#)),
            Script::Reply(text_reply("done")),
        ]);
        let mut agent = Agent::new(backend, "Hi.", quick_cfg(10))
            .with_tools(vec![type_tool(Arc::new(EchoTool))]);

        let result = agent.run("go").await;
        assert!(result.success);
        let tool_msg = &agent.messages()[3];
        assert_eq!(tool_msg.role, "tool");
        let body: Value = serde_json::from_str(tool_msg.content.as_deref().unwrap()).unwrap();
        assert!(body["error"].as_str().unwrap().contains("not found"));
        assert!(body["available_tools"]
            .as_array()
            .unwrap()
            .contains(&Value::String("type".into())));
    }

    #[tokio::test]
    async fn invalid_arguments_get_a_correction_hint() {
        let backend = ScriptedBackend::new(vec![
            Script::Reply(tool_reply("type", r#"{"text": 42}"#)),
            Script::Reply(text_reply("done")),
        ]);
        let mut agent = Agent::new(backend, "Hi.", quick_cfg(10))
            .with_tools(vec![type_tool(Arc::new(EchoTool))]);

        let result = agent.run("go").await;
        assert!(result.success);
        let tool_msg = &agent.messages()[3];
        let body: Value = serde_json::from_str(tool_msg.content.as_deref().unwrap()).unwrap();
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("Correct the arguments"));
    }

    #[tokio::test]
    async fn malformed_argument_json_is_skipped_not_fatal() {
        let backend = ScriptedBackend::new(vec![
            Script::Reply(tool_reply("type", r#"{"text": "#)),
            Script::Reply(text_reply("done")),
        ]);
        let mut agent = Agent::new(backend, "Hi.", quick_cfg(10))
            .with_tools(vec![type_tool(Arc::new(EchoTool))]);

        let result = agent.run("go").await;
        assert!(result.success);
        let body: Value =
            serde_json::from_str(agent.messages()[3].content.as_deref().unwrap()).unwrap();
        assert!(body["error"].as_str().unwrap().contains("Invalid JSON"));
    }

    #[tokio::test]
    async fn stop_is_observed_between_iterations() {
        let backend = ScriptedBackend::new(vec![
            Script::Reply(tool_reply("type", r#"{"text": "x"}"#)),
            Script::Reply(text_reply("never reached")),
        ]);
        let mut agent = Agent::new(backend, "Hi.", quick_cfg(10));
        let handle = agent.stop_handle();
        agent = agent.with_tools(vec![type_tool(Arc::new(StopTool(handle.clone())))]);

        let result = agent.run("go").await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Stopped by user"));
        assert_eq!(result.iterations, 1);

        // Repeated stops after the run are harmless.
        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn history_pruning_keeps_the_system_message() {
        let backend = ScriptedBackend::new(vec![
            Script::Reply(tool_reply("type", r#"{"text": "1"}"#)),
            Script::Reply(tool_reply("type", r#"{"text": "2"}"#)),
            Script::Reply(tool_reply("type", r#"{"text": "3"}"#)),
            Script::Reply(text_reply("done")),
        ]);
        let mut cfg = quick_cfg(10);
        cfg.history_limit = 4;
        let mut agent = Agent::new(backend, "system prompt", cfg)
            .with_tools(vec![type_tool(Arc::new(EchoTool))]);

        let result = agent.run("go").await;
        assert!(result.success);
        assert_eq!(agent.messages()[0].role, "system");
        assert!(agent.messages()[0]
            .content
            .as_deref()
            .unwrap()
            .starts_with("system prompt"));
    }

    #[tokio::test]
    async fn schema_is_appended_to_system_prompt() {
        let backend = ScriptedBackend::new(vec![Script::Reply(text_reply(
            r#"{"role": "X", "score": 1}"#,
        ))]);
        let mut agent =
            Agent::new(backend, "Parse.", quick_cfg(5)).with_response_schema(schema_for::<Review>());
        let result = agent.run("go").await;
        assert!(result.success);
        let system = agent.messages()[0].content.as_deref().unwrap();
        assert!(system.contains("valid JSON matching this exact schema"));
        assert!(system.contains("score"));
    }
}
