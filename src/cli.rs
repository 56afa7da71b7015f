//! CLI command handlers.

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::runtime::Runtime;

use leadbot::agent::{ChatOutcome, ChatRequest, Orchestrator, TurnStatus};
use leadbot::config::{save_config, Config, FunnelSettings};
use leadbot::funnel::{Stage, StageCatalog};
use leadbot::providers::ProviderModelFactory;
use leadbot::store::{ConversationStore, Role, TaskStatus};
use leadbot::utils::helpers::truncate_chars;

fn open_store(config: &Config) -> Result<Arc<ConversationStore>> {
    let path = config.db_path();
    let store = ConversationStore::new(&path)
        .with_context(|| format!("opening database {}", path.display()))?;
    Ok(Arc::new(store))
}

fn load_catalog(config: &Config) -> Result<StageCatalog> {
    match config.funnel.catalog_path() {
        Some(path) => StageCatalog::from_json_file(&path),
        None => Ok(StageCatalog::builtin()),
    }
}

/// Wire up the orchestrator from config. Built once per process.
fn build_orchestrator(config: &Config) -> Result<Orchestrator> {
    Ok(Orchestrator::new(
        open_store(config)?,
        Arc::new(load_catalog(config)?),
        Arc::new(ProviderModelFactory::from_config(config)),
        FunnelSettings::from(&config.funnel),
    ))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

pub(crate) fn cmd_chat(
    config: &Config,
    session: &str,
    message: &str,
    model: Option<String>,
    batch_wait: Option<u64>,
) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let mut request = ChatRequest::new(session, message);
    request.model = model;
    request.batch_wait_secs = batch_wait;

    let runtime = Runtime::new()?;
    match runtime.block_on(orchestrator.chat(request)) {
        Ok(outcome) => print_json(&outcome),
        Err(e) => {
            print_json(&json!({
                "error": e.to_string(),
                "kind": e.kind(),
                "status": e.status_code(),
            }))?;
            std::process::exit(2);
        }
    }
}

pub(crate) fn cmd_talk(config: &Config, session: &str, model: Option<String>) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let runtime = Runtime::new()?;
    runtime.block_on(talk_loop(&orchestrator, session, model))
}

async fn talk_loop(orchestrator: &Orchestrator, session: &str, model: Option<String>) -> Result<()> {
    println!("Talking as session '{}'. Type 'exit' to quit.\n", session);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("you> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if matches!(text, "exit" | "quit" | "/exit") {
            break;
        }

        let mut request = ChatRequest::new(session, text).with_batch_wait(0);
        request.model = model.clone();
        match orchestrator.chat(request).await {
            Ok(outcome) => {
                show_outcome(&outcome).await;
                if outcome.is_conversation_finished && outcome.stage_changed {
                    println!("  (conversation finished)");
                }
            }
            Err(e) => eprintln!("  [{}] {}", e.kind(), e),
        }
    }
    Ok(())
}

async fn show_outcome(outcome: &ChatOutcome) {
    let count = outcome.reply_fragments.len();
    for (i, fragment) in outcome.reply_fragments.iter().enumerate() {
        for line in fragment.text.lines() {
            println!("bot> {}", line);
        }
        if i + 1 < count && fragment.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(fragment.delay_ms)).await;
        }
    }
    if let (true, Some(prev)) = (outcome.stage_changed, outcome.previous_stage) {
        println!("  [stage {} -> {}]", prev, outcome.current_stage);
    }
    match outcome.status {
        TurnStatus::Escalated => {
            if let Some(task) = &outcome.escalation_task {
                println!("  [waiting for a human: task #{} {}]", task.id, task.title);
            }
        }
        TurnStatus::Duplicate => println!("  [duplicate message ignored]"),
        TurnStatus::Queued => println!("  [queued]"),
        TurnStatus::Replied => {}
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

pub(crate) fn cmd_session(config: &Config, id: &str) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let info = orchestrator.session_info(id)?;
    print_json(&info)
}

pub(crate) fn cmd_history(config: &Config, id: &str, limit: usize) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let messages = orchestrator.transcript(id, limit)?;
    if messages.is_empty() {
        println!("No messages.");
        return Ok(());
    }
    for m in messages {
        let who = match m.role {
            Role::User => "USER",
            Role::Assistant => "BOT ",
        };
        let stage = m.stage.map(Stage::as_str).unwrap_or("-");
        println!("#{:<5} {} {} [{}]", m.id, m.created_at, who, stage);
        for line in m.content.lines() {
            println!("        {}", line);
        }
    }
    Ok(())
}

pub(crate) fn cmd_sessions(config: &Config, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let sessions = store.list_sessions(limit)?;
    if sessions.is_empty() {
        println!("No sessions yet.");
        return Ok(());
    }
    println!(
        "{:<24} {:<13} {:>5} {:>6} {:<8} UPDATED",
        "SESSION", "STAGE", "MSGS", "TASKS", "FINISHED"
    );
    for s in sessions {
        println!(
            "{:<24} {:<13} {:>5} {:>6} {:<8} {}",
            truncate_chars(&s.session.external_id, 24),
            s.session.stage.as_str(),
            s.message_count,
            s.open_tasks,
            if s.session.finished { "yes" } else { "no" },
            s.session.updated_at
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Human tasks and review
// ---------------------------------------------------------------------------

pub(crate) fn cmd_tasks(config: &Config, include_completed: bool) -> Result<()> {
    let store = open_store(config)?;
    let tasks = store.list_tasks(include_completed, 100)?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    for t in tasks {
        println!(
            "#{} [{}] {} (session {}, assignee {})",
            t.id,
            t.status.as_str(),
            t.title,
            t.session_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
            t.assigned_to.as_deref().unwrap_or("-")
        );
        println!("    {}", truncate_chars(&t.description, 200));
    }
    Ok(())
}

pub(crate) fn cmd_close_task(
    config: &Config,
    id: i64,
    status: &str,
    assignee: Option<&str>,
) -> Result<()> {
    let Some(status) = TaskStatus::parse(status) else {
        bail!("unknown task status '{}' (use open, in_progress or closed)", status);
    };
    let store = open_store(config)?;
    match store.update_task_status(id, status, assignee)? {
        Some(task) => print_json(&task),
        None => bail!("task #{} not found", id),
    }
}

pub(crate) fn cmd_review(
    config: &Config,
    message_id: i64,
    rating: Option<u8>,
    note: &str,
    author: Option<&str>,
) -> Result<()> {
    if let Some(r) = rating {
        if !(1..=5).contains(&r) {
            bail!("rating must be between 1 and 5, got {}", r);
        }
    }
    let store = open_store(config)?;
    let saved = store
        .add_message_note(message_id, rating, note, author)
        .with_context(|| format!("saving note for message #{}", message_id))?;
    print_json(&saved)
}

pub(crate) fn cmd_note(
    config: &Config,
    session: &str,
    text: Option<&str>,
    author: Option<&str>,
) -> Result<()> {
    let store = open_store(config)?;
    let Some(row) = store.find_session(session)? else {
        bail!("session '{}' not found", session);
    };
    if let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) {
        let saved = store.add_session_note(row.id, text, author)?;
        println!("Note #{} saved.", saved.id);
    }
    for n in store.session_notes(row.id)? {
        println!("#{} {} [{}] {}", n.id, n.created_at, n.author.as_deref().unwrap_or("-"), n.note);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Setup and diagnostics
// ---------------------------------------------------------------------------

pub(crate) fn cmd_stages(config: &Config) -> Result<()> {
    let catalog = load_catalog(config)?;
    for stage in Stage::ALL {
        let def = catalog.get(stage);
        println!("{} ({})", stage.as_str().to_uppercase(), stage.order());
        println!("  objective: {}", def.objective);
        if let Some(next) = def.next {
            println!("  next: {}", next);
        }
        for part in &def.script {
            println!("  - {}", truncate_chars(&part.replace('\n', " "), 100));
        }
        if !def.snippets.is_empty() {
            let ids: Vec<&str> = def.snippets.keys().map(String::as_str).collect();
            println!("  snippets: {}", ids.join(", "));
        }
        println!();
    }
    let generic: Vec<&str> = catalog.generic_snippets().keys().map(String::as_str).collect();
    println!("generic snippets: {}", generic.join(", "));
    Ok(())
}

pub(crate) fn cmd_status(config: &Config, config_path: &Path) -> Result<()> {
    let db_path = config.db_path();
    println!("leadbot status\n");
    println!(
        "Config: {} [{}]",
        config_path.display(),
        if config_path.exists() { "ok" } else { "missing" }
    );
    println!(
        "Database: {} [{}]",
        db_path.display(),
        if db_path.exists() { "ok" } else { "not created yet" }
    );
    println!("Model: {}", config.agents.defaults.model);

    let providers = &config.providers;
    for (name, key) in [
        ("Gemini", &providers.gemini.api_key),
        ("OpenAI", &providers.openai.api_key),
        ("OpenRouter", &providers.openrouter.api_key),
    ] {
        println!(
            "{} API: {}",
            name,
            if key.is_empty() { "not set" } else { "configured" }
        );
    }
    match providers.vllm.api_base {
        Some(ref base) => println!("vLLM/Local: configured ({})", base),
        None => println!("vLLM/Local: not set"),
    }

    let orchestrator = build_orchestrator(config)?;
    let runtime = Runtime::new()?;
    let report = runtime.block_on(orchestrator.health_check());
    match report.error {
        None => println!("Provider health: {} ({})", report.status, report.model),
        Some(ref err) => println!("Provider health: {} ({}): {}", report.status, report.model, err),
    }
    Ok(())
}

pub(crate) fn cmd_init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
        return Ok(());
    }
    let written = save_config(&Config::default(), Some(config_path))?;
    println!("Created config at {}", written.display());
    println!("\nNext steps:");
    println!("  1. Add your Gemini API key (providers.gemini.apiKey) to the config");
    println!("  2. Chat: leadbot talk --session demo");
    Ok(())
}
