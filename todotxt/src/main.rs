use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use todotxt::search::normalize;
use todotxt::store::LogNotifier;
use todotxt::{FileRepository, SettingsFile, TaskIndex, TodoEngine, TodoRepository};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "todotxt",
    about = "todo.txt tooling: recurrence, deferral, filtering and search",
    version
)]
struct Cli {
    #[command(flatten)]
    globals: Globals,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Args)]
struct Globals {
    /// The todo.txt file to operate on.
    #[arg(long, global = true, default_value = "todo.txt")]
    file: PathBuf,
    /// View settings document (sort order and filters).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Pretend today is this date (YYYY-MM-DD).
    #[arg(long, global = true)]
    today: Option<NaiveDate>,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the filtered, sorted task list.
    List(ListArgs),

    /// Fuzzy-search all tasks, showing how each keystroke was answered.
    Search(SearchArgs),

    /// Run the day-rollover check (recurrences and deferred tasks).
    Check(CheckArgs),

    /// Append a task.
    Add(AddArgs),

    /// Toggle completion of a task by its number.
    Done(TaskArgs),

    /// Toggle the pin of a task by its number.
    Pin(TaskArgs),

    /// Toggle a priority, context, project or custom filter.
    Filter(FilterArgs),

    /// Move completed tasks into a done file.
    Archive(ArchiveArgs),

    /// Rewrite the file in canonical form.
    Format(FormatArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Emit JSON instead of numbered lines.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: String,
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Persist tasks changed by the check.
    #[arg(long)]
    write: bool,
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(required = true)]
    text: Vec<String>,
}

#[derive(Debug, Args)]
struct TaskArgs {
    /// Task number as printed by `list` (1-based position in the file).
    number: usize,
}

#[derive(Debug, Args)]
struct FilterArgs {
    /// `(A)`, `@context`, `+project` or a free-text term.
    keyword: Option<String>,
    /// Flip the inversion flag.
    #[arg(long)]
    invert: bool,
}

#[derive(Debug, Args)]
struct ArchiveArgs {
    /// Done file receiving the archived lines.
    #[arg(long)]
    done: PathBuf,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.globals.verbose);
    let globals = cli.globals;
    match cli.command {
        Commands::List(args) => handle_list(&globals, args),
        Commands::Search(args) => handle_search(&globals, args),
        Commands::Check(args) => handle_check(&globals, args),
        Commands::Add(args) => handle_add(&globals, args),
        Commands::Done(args) => handle_done(&globals, args),
        Commands::Pin(args) => handle_pin(&globals, args),
        Commands::Filter(args) => handle_filter(&globals, args),
        Commands::Archive(args) => handle_archive(&globals, args),
        Commands::Format(args) => handle_format(&globals, args),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "todotxt=debug" } else { "todotxt=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/* ------------------------------- Session ------------------------------- */

struct Session {
    repo: FileRepository,
    settings_file: Option<SettingsFile>,
    engine: TodoEngine,
    today: NaiveDate,
}

impl Session {
    fn open(globals: &Globals) -> Result<Self> {
        let today = globals
            .today
            .unwrap_or_else(|| Local::now().date_naive());
        let settings_file = globals.settings.clone().map(SettingsFile::new);
        let settings = settings_file
            .as_ref()
            .map(SettingsFile::load)
            .unwrap_or_default();

        let repo = FileRepository::new(&globals.file);
        let lines = repo
            .read_lines()
            .with_context(|| format!("reading {:?}", globals.file))?;

        let mut engine = TodoEngine::new(settings, today);
        engine.load_all(lines, today, &LogNotifier);
        debug!(tasks = engine.store().len(), %today, "session opened");
        Ok(Self {
            repo,
            settings_file,
            engine,
            today,
        })
    }

    fn task(&self, number: usize) -> Result<TaskIndex> {
        let len = self.engine.store().len();
        if number == 0 || number > len {
            anyhow::bail!("no task number {number} (the list has {len} tasks)");
        }
        Ok(TaskIndex(number - 1))
    }

    fn write_tasks(&self) -> Result<()> {
        self.repo
            .write_lines(&self.engine.to_lines())
            .with_context(|| format!("writing {:?}", self.repo.todo_path()))
    }

    fn save_settings(&self) -> Result<()> {
        let Some(file) = &self.settings_file else {
            anyhow::bail!("--settings is required to persist filters");
        };
        file.save(self.engine.settings())
            .with_context(|| format!("saving settings to {:?}", file.path()))
    }
}

fn render_viewport(engine: &TodoEngine) -> Vec<String> {
    engine
        .viewport()
        .iter()
        .filter_map(|&idx| engine.store().get(idx).map(|task| (idx, task)))
        .map(|(idx, task)| format!("{:>3} {}", idx.0 + 1, task.raw_text))
        .collect()
}

/* ------------------------------- Handlers ------------------------------- */

fn handle_list(globals: &Globals, args: ListArgs) -> Result<()> {
    let session = Session::open(globals)?;
    let engine = &session.engine;

    if args.json {
        #[derive(serde::Serialize)]
        struct JsonTask<'a> {
            number: usize,
            task: &'a todotxt::Task,
        }

        let payload: Vec<JsonTask<'_>> = engine
            .viewport()
            .iter()
            .filter_map(|&idx| {
                engine.store().get(idx).map(|task| JsonTask {
                    number: idx.0 + 1,
                    task,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for line in render_viewport(engine) {
            println!("{line}");
        }
    }

    let stats = engine.stats();
    eprintln!(
        "{} shown, {} open, {} total",
        engine.viewport().len(),
        stats.open_count(),
        stats.total
    );
    Ok(())
}

fn handle_search(globals: &Globals, args: SearchArgs) -> Result<()> {
    let mut session = Session::open(globals)?;
    let query = normalize(&args.query);
    if query.is_empty() {
        anyhow::bail!("search query is empty");
    }

    let mut last = None;
    for (end, ch) in query.char_indices() {
        let prefix = &query[..end + ch.len_utf8()];
        let outcome = session.engine.search(prefix);
        eprintln!(
            "{prefix:?}: {} results ({:?})",
            outcome.results.len(),
            outcome.source
        );
        last = Some(outcome.results.clone());
    }

    let store = session.engine.store();
    for idx in last.unwrap_or_default() {
        if let Some(task) = store.get(idx) {
            println!("{:>3} {}", idx.0 + 1, task.raw_text);
        }
    }
    session.engine.close_search();
    Ok(())
}

fn handle_check(globals: &Globals, args: CheckArgs) -> Result<()> {
    let session = Session::open(globals)?;
    let original = session
        .repo
        .read_lines()
        .with_context(|| format!("reading {:?}", globals.file))?;
    let changed = original != session.engine.to_lines();

    if !changed {
        println!("Nothing changed for {}", session.today);
        return Ok(());
    }
    if args.write {
        session.write_tasks()?;
        println!("Updated {:?}", session.repo.todo_path());
    } else {
        for line in session.engine.to_lines() {
            println!("{line}");
        }
    }
    Ok(())
}

fn handle_add(globals: &Globals, args: AddArgs) -> Result<()> {
    let mut session = Session::open(globals)?;
    let text = args.text.join(" ");
    if text.trim().is_empty() {
        anyhow::bail!("refusing to add an empty task");
    }
    let idx = session.engine.add_task(&text, session.today);
    session.write_tasks()?;
    info!(number = idx.0 + 1, "task added");
    println!("{:>3} {}", idx.0 + 1, text.trim());
    Ok(())
}

fn handle_done(globals: &Globals, args: TaskArgs) -> Result<()> {
    let mut session = Session::open(globals)?;
    let idx = session.task(args.number)?;
    session.engine.toggle_task(idx, session.today);
    session.write_tasks()?;
    print_task(&session, idx);
    Ok(())
}

fn handle_pin(globals: &Globals, args: TaskArgs) -> Result<()> {
    let mut session = Session::open(globals)?;
    let idx = session.task(args.number)?;
    session.engine.toggle_pin(idx, session.today);
    session.write_tasks()?;
    print_task(&session, idx);
    Ok(())
}

fn print_task(session: &Session, idx: TaskIndex) {
    if let Some(task) = session.engine.store().get(idx) {
        println!("{:>3} {}", idx.0 + 1, task.raw_text);
    }
}

fn handle_filter(globals: &Globals, args: FilterArgs) -> Result<()> {
    let mut session = Session::open(globals)?;
    if args.keyword.is_none() && !args.invert {
        anyhow::bail!("nothing to toggle: pass a keyword and/or --invert");
    }
    if let Some(keyword) = &args.keyword {
        let (category, active) = session.engine.toggle_filter(keyword);
        println!(
            "{keyword} ({category:?}) {}",
            if active { "on" } else { "off" }
        );
    }
    if args.invert {
        let inverted = session.engine.toggle_invert();
        println!("invert {}", if inverted { "on" } else { "off" });
    }
    session.save_settings()
}

fn handle_archive(globals: &Globals, args: ArchiveArgs) -> Result<()> {
    let mut session = Session::open(globals)?;
    let lines = session.engine.archive_completed(session.today);
    if lines.is_empty() {
        println!("No completed tasks to archive");
        return Ok(());
    }

    let done_repo = FileRepository::new(&globals.file).with_done_file(&args.done);
    done_repo
        .append_archive(&lines)
        .with_context(|| format!("appending to {:?}", args.done))?;
    session.write_tasks()?;
    println!("Archived {} tasks to {:?}", lines.len(), args.done);
    Ok(())
}

fn handle_format(globals: &Globals, args: FormatArgs) -> Result<()> {
    let session = Session::open(globals)?;
    if args.in_place {
        session.write_tasks()?;
    } else {
        for line in session.engine.to_lines() {
            println!("{line}");
        }
    }
    Ok(())
}
