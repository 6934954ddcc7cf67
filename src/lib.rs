pub mod agent;
pub mod agents;
pub mod browser;
pub mod llm;
pub mod refs;
pub mod schema;
pub mod session;
pub mod streaming;
pub mod tools;

pub use agent::{Agent, AgentConfig, AgentResult, StopHandle, Tool, ToolHandler, ToolSupervisor};
pub use agents::{
    answers_agent, apply_agent, parse_agent, tailor_agent, ApplicationAnswers, ApplyReport,
    CandidateData, ResumeProfile, TailoredResume, TextDocument,
};
pub use browser::{Browser, BrowserConfig, TabPool};
pub use llm::{ChatBackend, LlmConfig, OpenRouterClient, RetryPolicy};
pub use session::{
    ApplicationSession, EventSink, MemorySessionStore, SessionStatus, SessionStore, StreamBroker,
    StreamEvent,
};
pub use streaming::{run_supervised, StreamingSupervisor};
pub use tools::BrowserTools;
