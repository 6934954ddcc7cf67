use anyhow::Result;
use formpilot::{
    run_supervised, Browser, BrowserConfig, CandidateData, LlmConfig, MemorySessionStore,
    OpenRouterClient, SessionStatus, SessionStore, StreamBroker, TabPool,
};
use nanoid::nanoid;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let job_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "https://example.com/careers/backend-engineer/apply".to_string());

    let backend = Arc::new(OpenRouterClient::new(LlmConfig::default())?);
    let browser = if let Ok(ws) = std::env::var("CHROME_WS_URL") {
        Browser::connect(&ws, BrowserConfig { headless: false, user_agent: None }).await?
    } else {
        Browser::launch(BrowserConfig { headless: false, user_agent: None }).await?
    };
    let pool = TabPool::new(Arc::new(browser));
    let store = Arc::new(MemorySessionStore::new());
    let broker = Arc::new(StreamBroker::new());

    let session_id = nanoid!(8);
    let mut events = broker.subscribe(&session_id).await;

    // Print the live activity feed the way a frontend would render it.
    let printer = tokio::spawn(async move {
        while let Some(Some(event)) = events.recv().await {
            println!("[{}] {}", event.event_type, event.data);
        }
    });

    // Auto-resume any pause after a short review window, so the demo
    // runs unattended.
    tokio::spawn({
        let store = store.clone();
        let session_id = session_id.clone();
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
                if let Ok(Some(session)) = store.get_session(&session_id).await {
                    if session.status == SessionStatus::Paused {
                        println!("-- paused: {:?} -- resuming", session.error);
                        let _ = store
                            .update_status(&session_id, SessionStatus::Running, None)
                            .await;
                    }
                }
            }
        }
    });

    let candidate = CandidateData {
        first_name: "Jane".into(),
        last_name: "Doe".into(),
        full_name: "Jane Doe".into(),
        email: "jane.doe@example.com".into(),
        phone: "5555551234".into(),
        country_code: "+1".into(),
        phone_number: "+1 5555551234".into(),
        location: "San Francisco, CA".into(),
        resume_path: "data/resumes/jane_doe.pdf".into(),
        linkedin_url: Some("https://linkedin.com/in/janedoe".into()),
        github_url: Some("https://github.com/janedoe".into()),
        years_of_experience: 5,
        work_authorization: "Yes".into(),
        requires_sponsorship: false,
        resume_text: "Backend engineer with 5 years of Rust and Python experience...".into(),
        skills: vec!["Rust".into(), "Python".into(), "AWS".into()],
        ..CandidateData::default()
    };

    let screenshot_root = std::env::temp_dir().join("formpilot_screenshots");
    let result = run_supervised(
        backend,
        &pool,
        store.clone(),
        broker.clone(),
        &session_id,
        &job_url,
        &candidate,
        screenshot_root,
    )
    .await?;

    broker.remove(&session_id).await;
    let _ = printer.await;

    println!(
        "finished: success={} iterations={} output={:?}",
        result.success, result.iterations, result.output
    );
    Ok(())
}
