use std::error::Error;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use services::{AppServices, Clock, StudyPreferences, SyncConfig, TimerView};
use study_core::model::{Day, PlanDraft, PlanId, Session, UserId};
use study_core::timer::TimerState;

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    MissingFlag { flag: &'static str },
    UnknownArg(String),
    InvalidValue { flag: &'static str, raw: String },
    InvalidDbUrl { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::MissingFlag { flag } => write!(f, "{flag} is required"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidValue { flag, raw } => write!(f, "invalid {flag} value: {raw}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
        }
    }
}

impl Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn parse_value<T: FromStr>(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<T, ArgsError> {
    let raw = require_value(args, flag)?;
    raw.trim()
        .parse()
        .map_err(|_| ArgsError::InvalidValue { flag, raw })
}

/// Day and session numbers are 1-based on the command line.
fn parse_position(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<usize, ArgsError> {
    let raw = require_value(args, flag)?;
    raw.trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .ok_or(ArgsError::InvalidValue { flag, raw })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- list     [--db <sqlite_url>] [--user <id>]");
    eprintln!("  cargo run -p app -- seed     [--db <sqlite_url>] [--user <id>]");
    eprintln!("  cargo run -p app -- toggle   --plan <id> --day <n> --session <n>");
    eprintln!("  cargo run -p app -- study    --plan <id> --day <n> --session <n> [--minutes <m>]");
    eprintln!("  cargo run -p app -- watch");
    eprintln!("  cargo run -p app -- generate --title <title> --file <path> [--days <n>] [--minutes <m>]");
    eprintln!();
    eprintln!("Defaults:");
    eprintln!("  --db sqlite:study.sqlite3");
    eprintln!("  --user local");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  STUDY_DB_URL, STUDY_USER_ID, STUDY_TICK_MS, RUST_LOG");
    eprintln!("  STUDY_AI_API_KEY, STUDY_AI_BASE_URL, STUDY_AI_MODEL (generate)");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandKind {
    List,
    Seed,
    Toggle,
    Study,
    Watch,
    Generate,
}

impl CommandKind {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "list" => Some(Self::List),
            "seed" => Some(Self::Seed),
            "toggle" => Some(Self::Toggle),
            "study" => Some(Self::Study),
            "watch" => Some(Self::Watch),
            "generate" => Some(Self::Generate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SessionArgs {
    plan_id: PlanId,
    day_index: usize,
    session_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    List,
    Seed,
    Toggle(SessionArgs),
    Study {
        at: SessionArgs,
        minutes: Option<u32>,
    },
    Watch,
    Generate {
        title: String,
        file: PathBuf,
        preferences: StudyPreferences,
    },
}

struct Args {
    db_url: String,
    user_id: UserId,
    command: Command,
}

impl Args {
    fn parse(kind: CommandKind, args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut db_url = std::env::var("STUDY_DB_URL")
            .ok()
            .map_or_else(|| normalize_sqlite_url("sqlite:study.sqlite3".into()), normalize_sqlite_url);
        let mut user = std::env::var("STUDY_USER_ID").unwrap_or_else(|_| "local".into());
        let mut plan_id = None;
        let mut day_index = None;
        let mut session_index = None;
        let mut minutes = None;
        let mut days = None;
        let mut title = None;
        let mut file = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = normalize_sqlite_url(value);
                }
                "--user" => user = require_value(args, "--user")?,
                "--plan" => plan_id = Some(parse_value::<PlanId>(args, "--plan")?),
                "--day" => day_index = Some(parse_position(args, "--day")?),
                "--session" => session_index = Some(parse_position(args, "--session")?),
                "--minutes" => minutes = Some(parse_value::<u32>(args, "--minutes")?),
                "--days" => days = Some(parse_value::<u32>(args, "--days")?),
                "--title" => title = Some(require_value(args, "--title")?),
                "--file" => file = Some(PathBuf::from(require_value(args, "--file")?)),
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        let user_id = user.parse::<UserId>().map_err(|_| ArgsError::InvalidValue {
            flag: "--user",
            raw: user.clone(),
        })?;
        let session = || -> Result<SessionArgs, ArgsError> {
            Ok(SessionArgs {
                plan_id: plan_id.ok_or(ArgsError::MissingFlag { flag: "--plan" })?,
                day_index: day_index.ok_or(ArgsError::MissingFlag { flag: "--day" })?,
                session_index: session_index.ok_or(ArgsError::MissingFlag { flag: "--session" })?,
            })
        };

        let command = match kind {
            CommandKind::List => Command::List,
            CommandKind::Seed => Command::Seed,
            CommandKind::Watch => Command::Watch,
            CommandKind::Toggle => Command::Toggle(session()?),
            CommandKind::Study => Command::Study {
                at: session()?,
                minutes,
            },
            CommandKind::Generate => {
                let defaults = StudyPreferences::default();
                Command::Generate {
                    title: title.ok_or(ArgsError::MissingFlag { flag: "--title" })?,
                    file: file.ok_or(ArgsError::MissingFlag { flag: "--file" })?,
                    preferences: StudyPreferences {
                        days: days.unwrap_or(defaults.days),
                        minutes_per_day: minutes.unwrap_or(defaults.minutes_per_day),
                        start_date: None,
                    },
                }
            }
        };

        Ok(Self {
            db_url,
            user_id,
            command,
        })
    }
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = std::path::Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let mut argv: Vec<String> = std::env::args().skip(1).collect();

    // Without a subcommand, list the user's plans.
    let kind = match argv.first().map(String::as_str) {
        None => CommandKind::List,
        Some("--help" | "-h") => {
            print_usage();
            return Ok(());
        }
        Some(first) if first.starts_with("--") => CommandKind::List,
        Some(first) => CommandKind::from_arg(first).ok_or_else(|| {
            eprintln!("unknown subcommand: {first}");
            print_usage();
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unknown subcommand")
        })?,
    };

    if !argv.is_empty() && !argv[0].starts_with("--") {
        argv.remove(0);
    }

    let mut iter = argv.into_iter();
    let args = Args::parse(kind, &mut iter).map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    // Open + migrate SQLite at startup. Keep this in the binary glue so services stay pure.
    prepare_sqlite_file(&args.db_url)?;
    let config = SyncConfig::from_env();
    let app = AppServices::new_sqlite(&args.db_url, Clock::default_clock(), config).await?;
    log::debug!("opened {} for user {}", args.db_url, args.user_id);

    match args.command {
        Command::List => list(&app, &args.user_id).await,
        Command::Seed => seed(&app, &args.user_id).await,
        Command::Toggle(at) => toggle(&app, at).await,
        Command::Study { at, minutes } => {
            study(&app, &args.user_id, at, minutes, config.tick_interval.is_none()).await
        }
        Command::Watch => watch(&app, &args.user_id).await,
        Command::Generate {
            title,
            file,
            preferences,
        } => {
            let content = std::fs::read_to_string(&file)?;
            let plan_id = app
                .plans()
                .generate_plan(&args.user_id, &title, &content, &preferences)
                .await?;
            println!("created plan {plan_id} from {}", file.display());
            Ok(())
        }
    }
}

async fn list(app: &AppServices, user_id: &UserId) -> Result<(), Box<dyn Error>> {
    let plans = app.plans().list_plans(user_id).await?;
    if plans.is_empty() {
        println!("no plans for {user_id}; run `seed` to add a sample plan");
        return Ok(());
    }
    for plan in &plans {
        let done = plan
            .days()
            .iter()
            .flat_map(Day::sessions)
            .filter(|session| session.is_completed())
            .count();
        println!(
            "plan {}: {} ({}%, {done}/{} sessions)",
            plan.id(),
            plan.title(),
            plan.progress(),
            plan.session_count()
        );
        for (day_index, day) in plan.days().iter().enumerate() {
            for (session_index, session) in day.sessions().iter().enumerate() {
                println!(
                    "  day {} session {}: [{}] {} ({} min, {} spent)",
                    day_index + 1,
                    session_index + 1,
                    if session.is_completed() { 'x' } else { ' ' },
                    session.title(),
                    session.duration_minutes(),
                    clock_face(session.time_spent_ms())
                );
            }
        }
    }
    Ok(())
}

async fn seed(app: &AppServices, user_id: &UserId) -> Result<(), Box<dyn Error>> {
    let session = |title: &str, minutes: u32| Session::new(title, "", minutes);
    let days = vec![
        Day::new(
            1,
            "",
            vec![
                session("Skim the chapter outline", 15)?,
                session("Read sections 1 and 2", 30)?,
            ],
        ),
        Day::new(
            2,
            "",
            vec![
                session("Work through the examples", 30)?,
                session("Write a one-page summary", 20)?,
            ],
        ),
        Day::new(3, "", vec![session("Practice questions", 40)?]),
    ];
    let plan_id = app
        .plans()
        .import_plan(PlanDraft {
            user_id: user_id.clone(),
            title: "Sample study plan".into(),
            overview: "Three short days to try the timer and progress tracking.".into(),
            days,
        })
        .await?;
    println!("seeded plan {plan_id} for {user_id}");
    Ok(())
}

async fn toggle(app: &AppServices, at: SessionArgs) -> Result<(), Box<dyn Error>> {
    let outcome = app
        .sync()
        .toggle_session_completion(at.plan_id, at.day_index, at.session_index)
        .await?;
    if !outcome.saved {
        return Err(format!(
            "plan {} is {}% complete locally, but saving it failed",
            outcome.plan_id, outcome.progress
        )
        .into());
    }
    println!("plan {} is now {}% complete", outcome.plan_id, outcome.progress);
    Ok(())
}

async fn study(
    app: &AppServices,
    user_id: &UserId,
    at: SessionArgs,
    minutes: Option<u32>,
    manual_ticks: bool,
) -> Result<(), Box<dyn Error>> {
    let plan = app
        .plans()
        .get_plan(at.plan_id)
        .await?
        .ok_or_else(|| format!("plan {} not found", at.plan_id))?;
    if plan.user_id() != user_id {
        return Err(format!("plan {} belongs to another user", at.plan_id).into());
    }
    let session = plan
        .session(at.day_index, at.session_index)
        .ok_or_else(|| format!("plan {} has no such session", at.plan_id))?;
    if session.is_completed() {
        println!("\"{}\" is already completed", session.title());
        return Ok(());
    }
    let minutes = minutes.unwrap_or_else(|| session.duration_minutes());
    println!("studying \"{}\" for {minutes} min (Ctrl-C pauses)", session.title());

    let sync = app.sync();
    if let Err(err) = sync.attach_user(user_id).await {
        log::warn!("studying offline: {err}");
    }
    let mut timer = sync.observe_timer();
    sync.start_session(at.plan_id, at.day_index, at.session_index, minutes)
        .await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut shown_secs = None;
    let finished = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                let outcome = sync
                    .pause_session(at.plan_id, at.day_index, at.session_index)
                    .await?;
                println!();
                if outcome.view.state == TimerState::Completed {
                    break outcome.view;
                }
                println!("paused with {} left", clock_face(outcome.view.remaining_ms));
                sync.detach_user(user_id).await;
                return Ok(());
            }
            changed = timer.changed() => {
                changed?;
                let Some(view) = *timer.borrow_and_update() else {
                    continue;
                };
                if view.state.is_terminal() {
                    break view;
                }
                render_countdown(&view, &mut shown_secs)?;
            }
            _ = ticker.tick(), if manual_ticks => {
                sync.tick().await?;
            }
        }
    };

    println!();
    println!("session completed, {} tracked", clock_face(finished.time_spent_ms));
    let saved = sync.retry_save(at.plan_id).await?;
    sync.detach_user(user_id).await;
    if !saved.saved {
        return Err("the completed session could not be saved".into());
    }
    println!("plan {} is now {}% complete", saved.plan_id, saved.progress);
    Ok(())
}

fn render_countdown(view: &TimerView, shown_secs: &mut Option<u64>) -> std::io::Result<()> {
    let secs = view.remaining_ms.div_ceil(1000);
    if *shown_secs == Some(secs) {
        return Ok(());
    }
    *shown_secs = Some(secs);
    let mut out = std::io::stdout();
    write!(out, "\r{} left ", clock_face(view.remaining_ms))?;
    out.flush()
}

async fn watch(app: &AppServices, user_id: &UserId) -> Result<(), Box<dyn Error>> {
    let sync = app.sync();
    sync.attach_user(user_id).await?;
    let mut plans = sync.observe_all_plans_progress(user_id);
    println!("watching plans of {user_id} (Ctrl-C stops)");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = plans.changed() => {
                changed?;
                let line = plans
                    .borrow_and_update()
                    .iter()
                    .map(|(plan_id, progress)| format!("plan {plan_id}: {progress}%"))
                    .collect::<Vec<_>>()
                    .join(" | ");
                if !sync.is_connected(user_id) {
                    log::warn!("subscription lost, showing last known values");
                }
                println!("{line}");
            }
        }
    }
    sync.detach_user(user_id).await;
    Ok(())
}

fn clock_face(ms: u64) -> String {
    let secs = ms.div_ceil(1000);
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(err) = run().await {
        // At this layer (binary glue), printing once is fine.
        eprintln!("{err}");
        std::process::exit(2);
    }
}
