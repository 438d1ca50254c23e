use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use tintype_contracts::events::SessionLog;
use tintype_contracts::history::{HistoryItem, HistoryStore};
use tintype_contracts::models::{AspectRatio, GenerationModel, PromptMode};
use tintype_contracts::prompt;
use tintype_contracts::settings::SettingsStore;
use tintype_engine::backend::BackendRegistry;
use tintype_engine::dryrun::DryRunBackend;
use tintype_engine::{download_basename, ExtractionOutcome, StudioEngine};

#[derive(Debug, Parser)]
#[command(
    name = "tintype",
    version,
    about = "Generation studio: images with embedded provenance metadata"
)]
struct Cli {
    /// Directory holding settings, history, and the session journal.
    #[arg(long, default_value = ".tintype")]
    state_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Batch(BatchArgs),
    Refine(RefineArgs),
    Extract(ExtractArgs),
    Reuse(ReuseArgs),
    History(HistoryArgs),
    Describe(DescribeArgs),
    Video(VideoArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    /// Prompt text; in structured mode, the bracket-stripped parts form.
    prompt: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value_t = 1)]
    count: u32,
    #[arg(long)]
    aspect: Option<String>,
    /// Treat the prompt as structured parts (fast-edit model only).
    #[arg(long)]
    structured: bool,
    /// Rewrite the prompt with search grounding before generating.
    #[arg(long)]
    ground: bool,
    /// Reference image files to guide the edit.
    #[arg(long)]
    reference: Vec<PathBuf>,
    #[arg(long, default_value = "out")]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct BatchArgs {
    /// One prompt per suggestion.
    prompts: Vec<String>,
    /// Read prompts from a file instead, one per line.
    #[arg(long)]
    from_file: Option<PathBuf>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "out")]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct RefineArgs {
    /// History item to refine.
    #[arg(long)]
    item: String,
    /// Which of the item's images to refine.
    #[arg(long, default_value_t = 0)]
    index: usize,
    instruction: String,
    #[arg(long, default_value = "out")]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct ExtractArgs {
    /// JPEG or PNG file to read metadata from.
    input: PathBuf,
    /// Seed the form from the extracted record when it is usable.
    #[arg(long = "use")]
    use_metadata: bool,
}

#[derive(Debug, Parser)]
struct ReuseArgs {
    /// History item whose settings to restore.
    item: String,
    #[arg(long, default_value = "out")]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct HistoryArgs {
    #[command(subcommand)]
    command: HistoryCommand,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    List,
    Clear,
}

#[derive(Debug, Parser)]
struct DescribeArgs {
    image: PathBuf,
}

#[derive(Debug, Parser)]
struct VideoArgs {
    prompt: String,
    #[arg(long, default_value = "720p")]
    resolution: String,
    #[arg(long)]
    aspect: Option<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("tintype error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let state_dir = cli.state_dir;
    match cli.command {
        Command::Generate(args) => run_generate(args, &state_dir),
        Command::Batch(args) => run_batch(args, &state_dir),
        Command::Refine(args) => run_refine(args, &state_dir),
        Command::Extract(args) => run_extract(args, &state_dir),
        Command::Reuse(args) => run_reuse(args, &state_dir),
        Command::History(args) => run_history(args, &state_dir),
        Command::Describe(args) => run_describe(args, &state_dir),
        Command::Video(args) => run_video(args, &state_dir),
    }
}

struct Studio {
    engine: StudioEngine,
    settings: SettingsStore,
    history_path: PathBuf,
}

impl Studio {
    fn open(state_dir: &Path) -> Self {
        let log = SessionLog::for_session(state_dir.join("events.jsonl"));
        let backend = Arc::new(DryRunBackend);
        let mut backends = BackendRegistry::new();
        backends.register(GenerationModel::FastEdit, backend.clone());
        backends.register(GenerationModel::HighQuality, backend);

        let history_path = state_dir.join("history.json");
        let history = HistoryStore::load(&history_path);
        let settings = SettingsStore::new(state_dir.join("settings.json"));
        let mut engine = StudioEngine::new(backends, log).with_history(history);
        engine.apply_settings(&settings.load());
        Self {
            engine,
            settings,
            history_path,
        }
    }

    fn persist(&self) -> Result<()> {
        self.engine.history().save(&self.history_path)?;
        self.settings.save(&self.engine.persisted_settings())?;
        Ok(())
    }
}

fn run_generate(args: GenerateArgs, state_dir: &Path) -> Result<i32> {
    let mut studio = Studio::open(state_dir);
    if let Some(model) = &args.model {
        studio.engine.set_model(parse_model(model)?);
    }
    if args.structured {
        studio.engine.set_prompt_mode(PromptMode::Structured);
    } else {
        studio.engine.set_prompt_mode(PromptMode::Text);
    }
    if let Some(aspect) = &args.aspect {
        studio.engine.set_aspect_ratio(Some(parse_aspect(aspect)?));
    }
    for path in &args.reference {
        let bytes =
            fs::read(path).with_context(|| format!("reading reference {}", path.display()))?;
        studio.engine.add_reference_image(bytes);
    }
    if args.structured {
        studio.engine.set_prompt_from_display(&args.prompt);
    } else {
        studio.engine.set_prompt(&args.prompt);
    }

    if args.ground {
        let rewritten = studio.engine.ground_prompt()?;
        println!("grounded prompt: {rewritten}");
    }

    let id = studio.engine.generate(args.count)?;
    studio.persist()?;
    let item = studio
        .engine
        .history()
        .get(&id)
        .context("item just created")?;
    println!("created item {id} ({} images)", item.images.len());
    write_item_images(item, &args.out)?;
    Ok(0)
}

fn run_batch(args: BatchArgs, state_dir: &Path) -> Result<i32> {
    let mut prompts = args.prompts;
    if let Some(path) = &args.from_file {
        let raw =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        prompts.extend(raw.lines().map(str::to_string));
    }
    let prompts: Vec<String> = prompts
        .into_iter()
        .filter(|line| !line.trim().is_empty())
        .collect();
    if prompts.is_empty() {
        bail!("no prompts given; pass them as arguments or via --from-file");
    }
    let total = prompts.len();

    let mut studio = Studio::open(state_dir);
    if let Some(model) = &args.model {
        studio.engine.set_model(parse_model(model)?);
    }
    let ids = studio.engine.generate_batch(prompts)?;
    studio.persist()?;
    println!("batch settled: {} of {} succeeded", ids.len(), total);
    for id in &ids {
        if let Some(item) = studio.engine.history().get(id) {
            println!("created item {id}: {}", snippet(&item.metadata.prompt));
            write_item_images(item, &args.out)?;
        }
    }
    Ok(0)
}

fn run_refine(args: RefineArgs, state_dir: &Path) -> Result<i32> {
    let mut studio = Studio::open(state_dir);
    if !studio.engine.select_history(&args.item) {
        bail!("history item '{}' not found", args.item);
    }
    let id = studio.engine.refine(None, args.index, &args.instruction)?;
    studio.persist()?;
    let item = studio.engine.history().get(&id).context("refined item")?;
    println!(
        "refined item {id}, image {} (model: {})",
        args.index + 1,
        item.metadata.model.as_str()
    );
    write_item_images(item, &args.out)?;
    Ok(0)
}

fn run_extract(args: ExtractArgs, state_dir: &Path) -> Result<i32> {
    let bytes =
        fs::read(&args.input).with_context(|| format!("reading {}", args.input.display()))?;
    let mut studio = Studio::open(state_dir);
    match studio.engine.extract_from_bytes(&bytes)? {
        ExtractionOutcome::Found { valid } => {
            let state = studio.engine.extracted().context("extracted state")?;
            println!("model: {}", state.record.model.as_str());
            println!("mode: {}", state.record.mode().as_str());
            if let Some(ratio) = state.record.aspect_ratio {
                println!("aspect ratio: {}", ratio.as_str());
            }
            if let Some(original) = &state.record.original_prompt {
                println!("original prompt: {original}");
            }
            let shown = if state.record.mode() == PromptMode::Structured {
                prompt::display_form(&state.record.prompt)
            } else {
                state.record.prompt.clone()
            };
            println!("prompt: {shown}");
            if valid {
                println!("status: usable");
            } else {
                println!("status: {}", state.message);
            }
            if args.use_metadata {
                studio.engine.use_extracted()?;
                studio.persist()?;
                println!("form seeded from extracted metadata");
            }
        }
        ExtractionOutcome::NotFound => println!("no generation metadata found"),
    }
    Ok(0)
}

fn run_reuse(args: ReuseArgs, state_dir: &Path) -> Result<i32> {
    let mut studio = Studio::open(state_dir);
    if !studio.engine.select_history(&args.item) {
        bail!("history item '{}' not found", args.item);
    }
    studio.persist()?;
    let form = studio.engine.form();
    println!(
        "restored: model {}, mode {}, prompt {}",
        form.model.as_str(),
        form.prompt_mode.as_str(),
        snippet(&form.prompt)
    );
    let item = studio
        .engine
        .history()
        .get(&args.item)
        .context("selected item")?;
    write_item_images(item, &args.out)?;
    Ok(0)
}

fn run_history(args: HistoryArgs, state_dir: &Path) -> Result<i32> {
    let mut studio = Studio::open(state_dir);
    match args.command {
        HistoryCommand::List => {
            if studio.engine.history().is_empty() {
                println!("history is empty");
                return Ok(0);
            }
            for item in studio.engine.history().items() {
                println!(
                    "{}  {}  {}  {} ({} images)",
                    item.id,
                    item.timestamp,
                    item.metadata.model.as_str(),
                    snippet(&item.metadata.prompt),
                    item.images.len()
                );
            }
        }
        HistoryCommand::Clear => {
            let count = studio.engine.history().len();
            studio.engine.clear_history();
            studio.persist()?;
            println!("cleared {count} items");
        }
    }
    Ok(0)
}

fn run_describe(args: DescribeArgs, state_dir: &Path) -> Result<i32> {
    let bytes =
        fs::read(&args.image).with_context(|| format!("reading {}", args.image.display()))?;
    let mut studio = Studio::open(state_dir);
    let text = studio.engine.describe_image(&bytes)?;
    println!("{text}");
    Ok(0)
}

fn run_video(args: VideoArgs, state_dir: &Path) -> Result<i32> {
    let mut studio = Studio::open(state_dir);
    studio.engine.set_prompt(&args.prompt);
    studio.engine.set_prompt_mode(PromptMode::Text);
    if let Some(aspect) = &args.aspect {
        studio.engine.set_aspect_ratio(Some(parse_aspect(aspect)?));
    }
    let url = studio.engine.generate_video(&args.resolution)?;
    println!("video ready: {url}");
    Ok(0)
}

fn write_item_images(item: &HistoryItem, out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating output directory {}", out_dir.display()))?;
    for (index, image) in item.images.iter().enumerate() {
        let path = out_dir.join(download_basename(item, index));
        fs::write(&path, &image.bytes)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("wrote {}", path.display());
    }
    Ok(())
}

fn parse_model(raw: &str) -> Result<GenerationModel> {
    match raw {
        "fast-edit" => Ok(GenerationModel::FastEdit),
        "high-quality" => Ok(GenerationModel::HighQuality),
        other => bail!("unknown model '{other}' (expected 'fast-edit' or 'high-quality')"),
    }
}

fn parse_aspect(raw: &str) -> Result<AspectRatio> {
    AspectRatio::parse(raw).ok_or_else(|| anyhow!("unknown aspect ratio '{raw}'"))
}

fn snippet(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("");
    let mut out: String = first_line.chars().take(60).collect();
    if first_line.chars().count() > 60 {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_names_parse_or_explain() {
        assert_eq!(parse_model("fast-edit").unwrap(), GenerationModel::FastEdit);
        assert_eq!(
            parse_model("high-quality").unwrap(),
            GenerationModel::HighQuality
        );
        let err = parse_model("imagen").expect_err("unknown model");
        assert!(err.to_string().contains("expected 'fast-edit'"));
    }

    #[test]
    fn aspect_names_parse_or_explain() {
        assert_eq!(parse_aspect("16:9").unwrap(), AspectRatio::Widescreen);
        assert!(parse_aspect("7:5").is_err());
    }

    #[test]
    fn snippets_stay_single_line_and_short() {
        assert_eq!(snippet("a fox\nsecond line"), "a fox");
        let long = "x".repeat(80);
        let cut = snippet(&long);
        assert_eq!(cut.chars().count(), 63);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn studio_round_trips_state_through_disk() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let state_dir = temp.path().join("state");

        let mut studio = Studio::open(&state_dir);
        studio.engine.set_prompt("a red fox");
        let id = studio.engine.generate(1)?;
        studio.persist()?;

        let reopened = Studio::open(&state_dir);
        assert_eq!(reopened.engine.history().len(), 1);
        assert!(reopened.engine.history().get(&id).is_some());
        assert_eq!(reopened.engine.form().prompt, "a red fox");
        // Volatile state does not survive the reopen.
        assert!(reopened.engine.results().is_empty());
        assert_eq!(
            reopened.engine.selection(),
            &tintype_engine::ActiveSelection::None
        );
        Ok(())
    }
}
