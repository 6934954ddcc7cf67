use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, info};

use crate::agent::{Agent, AgentConfig, Tool, ToolHandler};
use crate::llm::ChatBackend;
use crate::schema::schema_for;
use crate::tools::BrowserTools;

// ========================= System Prompts =========================

const SYSTEM_PROMPT_APPLY: &str = r#"You are an AI job application agent with browser automation capabilities. Your mission is to complete job applications on behalf of a candidate by navigating web forms, filling fields accurately, and submitting applications.

## WORKFLOW

### Step 1: DISCOVERY PHASE (MANDATORY - DO THIS FIRST!)
1. Call get_page_state() to see the current page.
2. Systematically identify ALL form fields, separating REQUIRED fields (asterisk, "required", aria-required) from optional ones, and note their refs.
3. Identify field types (text input, dropdown, checkbox, file upload, textarea, radio, autocomplete).
4. Look for multi-page indicators ("Next", "Continue", step counters like 1/3).
5. Plan which candidate data goes into which field BEFORE you start filling.

### Step 2: Fill the Application (Systematically)
- Use browser_fill_form() to batch-fill multiple text fields at once; group related fields together.
- Only call get_page_state() when necessary: after navigation, after errors, or for pre-submission validation.
- Match form fields to candidate data intelligently ("First Name" -> candidate.first_name, "Email" -> candidate.email, "Phone" -> candidate.phone_number with country code, "Resume" -> browser_file_upload with the ACTUAL candidate.resume_path, "LinkedIn" -> candidate.linkedin_url, and so on).
- For text questions, base answers STRICTLY on the candidate's resume. Active voice, professional and conversational, no markdown, no AI-isms ("Furthermore", "In conclusion"). Use the STAR method for behavioral questions.

### Step 3: PRE-SUBMISSION VALIDATION (MANDATORY!)
Before clicking ANY "Submit" or "Apply" button: call get_page_state() one final time, verify EVERY required field is filled, and check for validation warnings. Fill anything missing before submitting.

### Step 4: Special Cases
- Autocomplete dropdowns (City, Country): browser_type the value, browser_wait_for(time=2), get_page_state(), then browser_click the matching suggestion. Never just type and move on.
- Checkboxes: check legal agreements, uncheck optional notifications, skip voluntary demographics unless required.
- File uploads: use browser_file_upload with the EXACT candidate.resume_path. NEVER use placeholder paths like "/path/to/resume.pdf".
- Multi-page forms: discover -> fill -> verify -> click "Next" -> get_page_state() -> repeat. Run the pre-submission validation on the final page.

### Step 5: Submit
Click the submit button ("Submit", "Apply", "Send Application") only after validation, then wait for a confirmation message ("Application submitted", "Thank you"). If an error about missing fields appears, fix the field and retry.

## CRITICAL RULES
1. NEVER fabricate information - only use data from the candidate's resume.
2. NEVER lie about qualifications - emphasize transferable skills instead.
3. If a required field has no matching data, use "N/A" or skip if optional.
4. Always use refs from get_page_state() for clicks and typing; if a ref is invalid, call get_page_state() again for fresh refs.
5. CAPTCHA -> stop and report; it cannot be solved programmatically.

## CANDIDATE DATA
The candidate data is provided as a JSON object (first_name, last_name, email, phone_number, location, resume_path, linkedin_url, years_of_experience, work_authorization, requires_sponsorship, resume_text, skills, ...). Treat it as the single source of truth for every field and question."#;

const SYSTEM_PROMPT_TAILOR: &str = r#"You are a Senior Technical Resume Strategist and ATS Optimizer. Analyze a candidate's resume against a Job Description (JD) and surgically update it using targeted replacements.

### GOAL
Use the replace tool to update key resume sections (summary, job descriptions, skills) to maximize JD alignment while preserving authenticity. Make 3-5 targeted replacements with the highest ATS impact.

### HOW TO USE THE REPLACE TOOL
- search_text must match exactly, appear only ONCE in the resume, and be a single line without newlines.
- Plan your replacements: Professional Summary -> Most Recent Job -> Key Skills -> Previous Job.
- Stop after 5 replacements; quality over quantity.

### REPLACEMENT TEXT RULES
FORBIDDEN: inserting technologies the candidate has not used, copying exact JD phrases, rewriting job roles or dates, fabricating anything.
REQUIRED: rephrase JD requirements into the candidate's actual experience, keep every claim fact-checkable, be specific with metrics and tool names.

### WORKFLOW
1. Score the resume BEFORE tailoring (0-100, based on JD alignment).
2. Make 3-5 replacements with the replace tool, waiting for each tool response.
3. Re-score the resume AFTER tailoring (should be higher).
4. Then STOP calling tools and output ONLY the JSON response matching the required schema - no other text."#;

const SYSTEM_PROMPT_PARSE: &str = r#"You are an expert resume parser. Extract ALL information from the resume into the structured format.

Rules:
- Extract every section completely: contact information, professional summary, job experience (with ALL bullet points), education, skills grouped by category, certifications, projects, achievements.
- DO NOT summarize or truncate; extract values exactly as they appear.
- Return empty arrays for missing sections, never omit fields.
- If dates are missing, use null. Use "Present" for current positions."#;

const SYSTEM_PROMPT_ANSWERS: &str = r#"You are an expert job applicant. You will be provided with a Resume, a Job Description (JD), and application questions.

Goal: draft high-quality, authentic responses that maximize the applicant's chances of an interview.

Guidelines:
- Source of truth is the resume. Never invent experiences; if the resume lacks something the JD asks for, emphasize transferable skills instead of lying.
- Analyze the JD for key skills and pain points and show how the applicant's background addresses them.
- Professional, confident, conversational tone. Active voice ("I built", "I managed"). No robotic transitions ("In conclusion", "Furthermore"). Plain text, no markdown.
- For behavioral questions ("Tell me about a time...") follow the STAR method."#;

// ========================= Structured Outputs =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Gcp,
    Azu,
}

/// Final report from an application run.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ApplyReport {
    /// Whether the application was actually submitted.
    pub submitted: bool,
    /// Confirmation text observed after submission, if any.
    #[serde(default)]
    pub confirmation_message: Option<String>,
    /// Short account of what was filled and any fields that were skipped.
    pub summary: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct TailoredResume {
    /// Job title from the JD.
    pub role: String,
    pub company_name: String,
    #[serde(default)]
    pub date_posted: Option<String>,
    /// Dominant cloud technology in the JD.
    #[serde(default)]
    pub cloud: Option<CloudProvider>,
    /// Score before tailoring, 0-100.
    pub resume_score: f64,
    /// What was changed and why, 2-3 sentences.
    pub job_match_summary: String,
    /// Score after tailoring, 0-100.
    pub new_resume_score: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
pub struct ContactInfo {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub linkedin_url: Option<String>,
    #[serde(default)]
    pub github_url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct JobExperience {
    pub job_title: String,
    pub company_name: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub from_date: Option<String>,
    /// "Present" for current positions.
    #[serde(default)]
    pub to_date: Option<String>,
    /// All bullet points for this job.
    pub experience: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct Education {
    pub degree: String,
    #[serde(default)]
    pub major: Option<String>,
    pub college: String,
    #[serde(default)]
    pub from_date: Option<String>,
    #[serde(default)]
    pub to_date: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct SkillGroup {
    /// Category, e.g. "Languages" or "Cloud/Infrastructure".
    pub title: String,
    /// Comma-separated skills in this category.
    pub skills: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct Certification {
    pub title: String,
    #[serde(default)]
    pub obtained_date: Option<String>,
    #[serde(default)]
    pub expiry_date: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct Project {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub technologies: Vec<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct Achievement {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
}

/// Fully parsed resume.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ResumeProfile {
    pub contact: ContactInfo,
    #[serde(default)]
    pub professional_summary: Option<String>,
    #[serde(default)]
    pub job_experience: Vec<JobExperience>,
    #[serde(default)]
    pub education: Vec<Education>,
    #[serde(default)]
    pub skills: Vec<SkillGroup>,
    #[serde(default)]
    pub certifications: Vec<Certification>,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub achievements: Vec<Achievement>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct QuestionAnswer {
    pub question: String,
    pub answer: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ApplicationAnswers {
    pub answers: Vec<QuestionAnswer>,
}

// ========================= Candidate Data =========================

/// Everything the apply agent may need to fill a form. Serialized
/// verbatim into the query as the single source of truth.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CandidateData {
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub email: String,
    pub phone: String,
    pub country_code: String,
    pub phone_number: String,
    pub location: String,
    pub resume_path: String,
    #[serde(default)]
    pub linkedin_url: Option<String>,
    #[serde(default)]
    pub github_url: Option<String>,
    #[serde(default)]
    pub portfolio_url: Option<String>,
    pub years_of_experience: u32,
    pub work_authorization: String,
    pub requires_sponsorship: bool,
    #[serde(default)]
    pub desired_salary: Option<String>,
    pub resume_text: String,
    #[serde(default)]
    pub skills: Vec<String>,
    /// Additional fields from onboarding, passed through untouched.
    #[serde(default)]
    pub user_data: Option<Value>,
}

// ========================= Document Tool =========================

/// Plain-text resume document with targeted replacement. Saves to disk
/// after every successful replacement so a partially-tailored resume is
/// never lost.
pub struct TextDocument {
    path: PathBuf,
    content: StdMutex<String>,
}

impl TextDocument {
    pub fn load(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)?;
        Ok(Self {
            path,
            content: StdMutex::new(content),
        })
    }

    pub fn from_string(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: StdMutex::new(content.into()),
        }
    }

    pub fn content(&self) -> String {
        self.content.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Exact-match single replacement. Ambiguous or missing search text
    /// comes back as a tool-level error message the model can act on.
    pub fn replace(&self, search_text: &str, replace_text: &str) -> String {
        let mut content = match self.content.lock() {
            Ok(c) => c,
            Err(_) => return "ERROR: document unavailable".into(),
        };
        let count = content.matches(search_text).count();
        match count {
            1 => {
                *content = content.replacen(search_text, replace_text, 1);
                if let Err(e) = std::fs::write(&self.path, content.as_bytes()) {
                    return format!("ERROR: failed to save document: {e}");
                }
                debug!(path = %self.path.display(), "document saved after replacement");
                "Successfully replaced".into()
            }
            0 => "ERROR: search_text not found in document. Make sure to include exact text \
                  from the resume including newlines and spacing. Consider copying-pasting \
                  directly from the resume."
                .into(),
            n => format!(
                "ERROR: search_text appears {n} times in the resume. To fix this, include MORE \
                 CONTEXT (dates, section headers, job titles, adjacent bullets) to make your \
                 search_text unique and appear only ONCE."
            ),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReplaceArgs {
    /// Exact string value to replace in the document.
    pub search_text: String,
    /// New string value to replace with.
    pub replace_text: String,
}

struct ReplaceHandler(Arc<TextDocument>);

#[async_trait]
impl ToolHandler for ReplaceHandler {
    async fn call(&self, args: Value) -> Value {
        match serde_json::from_value::<ReplaceArgs>(args) {
            Ok(a) => Value::String(self.0.replace(&a.search_text, &a.replace_text)),
            Err(e) => json!({"error": format!("Invalid arguments: {e}")}),
        }
    }
}

pub fn replace_tool(document: Arc<TextDocument>) -> Tool {
    Tool::new(
        "replace",
        "Replace the exact string in the resume",
        schema_for::<ReplaceArgs>(),
        Arc::new(ReplaceHandler(document)),
    )
}

// ========================= Agent Constructors =========================

/// Form-filling agent with the full browser tool table. Low temperature
/// keeps field values deterministic.
pub fn apply_agent(backend: Arc<dyn ChatBackend>, tools: &Arc<BrowserTools>) -> Agent {
    let cfg = AgentConfig {
        temperature: 0.3,
        ..AgentConfig::default()
    };
    info!(session_id = %tools.session_id(), "building apply agent");
    Agent::new(backend, SYSTEM_PROMPT_APPLY, cfg)
        .with_tools(tools.registry())
        .with_response_schema(schema_for::<ApplyReport>())
}

pub fn tailor_agent(backend: Arc<dyn ChatBackend>, document: Arc<TextDocument>) -> Agent {
    let cfg = AgentConfig {
        temperature: 0.7,
        max_iterations: 10,
        ..AgentConfig::default()
    };
    Agent::new(backend, SYSTEM_PROMPT_TAILOR, cfg)
        .with_tools(vec![replace_tool(document)])
        .with_response_schema(schema_for::<TailoredResume>())
}

/// Pure extraction, no tools. A couple of iterations leave room for one
/// round of output repair.
pub fn parse_agent(backend: Arc<dyn ChatBackend>) -> Agent {
    let cfg = AgentConfig {
        temperature: 0.1,
        max_iterations: 3,
        ..AgentConfig::default()
    };
    Agent::new(backend, SYSTEM_PROMPT_PARSE, cfg).with_response_schema(schema_for::<ResumeProfile>())
}

pub fn answers_agent(backend: Arc<dyn ChatBackend>) -> Agent {
    let cfg = AgentConfig {
        temperature: 0.7,
        max_iterations: 3,
        ..AgentConfig::default()
    };
    Agent::new(backend, SYSTEM_PROMPT_ANSWERS, cfg)
        .with_response_schema(schema_for::<ApplicationAnswers>())
}

// ========================= Query Builders =========================

pub fn apply_query(job_url: &str, candidate: &CandidateData) -> String {
    let data = serde_json::to_string_pretty(candidate).unwrap_or_default();
    format!(
        "Apply to the job at: {job_url}\n\n\
         Use this candidate data to fill the application:\n{data}\n\n\
         Steps:\n\
         1. Navigate to the job URL\n\
         2. Call get_page_state() to see the application form\n\
         3. Fill all required fields with candidate data\n\
         4. Answer any questions based on the candidate's resume\n\
         5. Submit the application\n\
         6. Verify success (look for confirmation message)"
    )
}

pub fn tailor_query(resume_text: &str, job_description: &str) -> String {
    format!(
        "Resume starts here\n---\n{resume_text}\n---\nResume ends here\n\n\
         Job description starts here\n---\n{job_description}\n---\nJob description ends here\n\n\
         Analyze the resume against the job description and create a tailored version using \
         the tools you have available."
    )
}

pub fn parse_query(resume_text: &str) -> String {
    format!(
        "Resume starts here\n---\n{resume_text}\n---\nResume ends here\n\n\
         Parse this resume and extract all fields."
    )
}

pub fn answers_query(resume: &str, job_description: &str, questions: &[String]) -> String {
    let questions_text = questions
        .iter()
        .enumerate()
        .map(|(i, q)| format!("{}. {q}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Resume starts here\n---\n{resume}\n---\nResume ends here\n\n\
         Job description starts here\n---\n{job_description}\n---\nJob description ends here\n\n\
         Application questions:\n{questions_text}\n\n\
         Answer each question professionally and authentically based on the resume."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(content: &str) -> (tempfile::TempDir, Arc<TextDocument>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.txt");
        std::fs::write(&path, content).unwrap();
        let document = Arc::new(TextDocument::load(&path).unwrap());
        (dir, document)
    }

    #[test]
    fn replace_unique_match_saves_to_disk() {
        let (dir, document) = doc("Summary: backend engineer.\nSkills: Python, SQL\n");
        let result = document.replace("Skills: Python, SQL", "Skills: Python, SQL, Rust");
        assert_eq!(result, "Successfully replaced");
        assert!(document.content().contains("Rust"));
        let on_disk = std::fs::read_to_string(dir.path().join("resume.txt")).unwrap();
        assert!(on_disk.contains("Skills: Python, SQL, Rust"));
    }

    #[test]
    fn replace_missing_text_reports_error() {
        let (_dir, document) = doc("Summary: backend engineer.\n");
        let result = document.replace("Skills: Go", "Skills: Rust");
        assert!(result.starts_with("ERROR: search_text not found"));
        assert_eq!(document.content(), "Summary: backend engineer.\n");
    }

    #[test]
    fn replace_ambiguous_text_reports_count() {
        let (_dir, document) = doc("led the team\nled the team\n");
        let result = document.replace("led the team", "drove the team");
        assert!(result.contains("appears 2 times"));
        // Nothing changed on ambiguity.
        assert_eq!(document.content(), "led the team\nled the team\n");
    }

    #[tokio::test]
    async fn replace_handler_speaks_tool_protocol() {
        let (_dir, document) = doc("old line\n");
        let tool = replace_tool(document);
        let out = tool
            .handler
            .call(json!({"search_text": "old line", "replace_text": "new line"}))
            .await;
        assert_eq!(out, Value::String("Successfully replaced".into()));

        let bad = tool.handler.call(json!({"search_text": 1})).await;
        assert!(bad["error"].as_str().unwrap().contains("Invalid arguments"));
    }

    #[test]
    fn tailored_resume_schema_round_trip() {
        let raw = json!({
            "role": "Platform Engineer",
            "company_name": "Acme",
            "cloud": "aws",
            "resume_score": 65,
            "job_match_summary": "Aligned summary and skills with the JD.",
            "new_resume_score": 82
        });
        let parsed: TailoredResume = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.cloud, Some(CloudProvider::Aws));
        assert!(parsed.new_resume_score > parsed.resume_score);
        assert!(parsed.date_posted.is_none());
    }

    #[test]
    fn resume_profile_accepts_sparse_input() {
        let raw = json!({
            "contact": {"name": "Jane Doe", "email": "jane@example.com"}
        });
        let parsed: ResumeProfile = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.contact.name, "Jane Doe");
        assert!(parsed.job_experience.is_empty());
        assert!(parsed.skills.is_empty());
    }

    #[test]
    fn queries_embed_their_inputs() {
        let candidate = CandidateData {
            full_name: "Jane Doe".into(),
            email: "jane@example.com".into(),
            resume_path: "data/resumes/jane.pdf".into(),
            ..CandidateData::default()
        };
        let q = apply_query("https://jobs.example.com/123", &candidate);
        assert!(q.contains("https://jobs.example.com/123"));
        assert!(q.contains("data/resumes/jane.pdf"));
        assert!(q.contains("get_page_state()"));

        let q = answers_query(
            "resume body",
            "jd body",
            &["Why us?".into(), "Visa status?".into()],
        );
        assert!(q.contains("1. Why us?"));
        assert!(q.contains("2. Visa status?"));
    }
}
