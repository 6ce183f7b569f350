use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use posterforge_contracts::{
    AspectRatio, BrandIdentity, ContentBrief, FileStatusStore, JobStatus, JobStore, StatusStore,
};
use posterforge_engine::{
    BackgroundGenerator, CancelToken, Compositor, CopyGenerator, DryrunCopywriter,
    DryrunImageProvider, FsArtifactStore, GenerationController, IdeogramProvider, ImageTaskProvider,
    OpenAiCopywriter, ReplicateProvider,
};

#[derive(Debug, Parser)]
#[command(name = "posterforge", version, about = "Poster generation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a job and run it to a terminal state.
    Generate(GenerateArgs),
    /// Print the live status record for a job.
    Status(StatusArgs),
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    /// Brand identity JSON file.
    #[arg(long)]
    brand: PathBuf,
    #[arg(long)]
    theme: String,
    #[arg(long)]
    occasion: Option<String>,
    #[arg(long)]
    instructions: Option<String>,
    /// square | portrait | landscape
    #[arg(long, default_value = "square")]
    aspect: String,
    /// Data directory: job records, status records, and posters land here.
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value = "local")]
    owner: String,
    /// Abort the job after this many seconds.
    #[arg(long)]
    timeout: Option<u64>,
    /// Run offline with deterministic collaborators.
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct StatusArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value = "local")]
    owner: String,
    #[arg(long)]
    job: String,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("posterforge error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Status(args) => run_status(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let brand = load_brand(&args.brand)?;
    let Some(aspect) = AspectRatio::parse(&args.aspect) else {
        bail!("unknown aspect ratio {:?} (square, portrait, landscape)", args.aspect);
    };
    let brief = ContentBrief {
        theme: args.theme,
        occasion: args.occasion,
        instructions: args.instructions,
    };

    let controller = build_controller(&args.out, args.dryrun)?;
    let cancel = match args.timeout {
        Some(seconds) => CancelToken::with_deadline(Duration::from_secs(seconds)),
        None => CancelToken::new(),
    };

    let job = controller.create_job(&args.owner, brand, brief, aspect)?;
    println!("job {} created for owner {}", job.job_id, job.owner_id);

    let finished = controller.run(&args.owner, &job.job_id, &cancel)?;
    println!("{}", serde_json::to_string_pretty(&finished)?);

    // The terminal state has been consumed; drop the advisory record.
    let status = FileStatusStore::new(args.out.join("status"));
    status.clear(&finished.owner_id, &finished.job_id)?;

    Ok(if finished.status == JobStatus::Complete {
        0
    } else {
        1
    })
}

fn run_status(args: StatusArgs) -> Result<i32> {
    let status = FileStatusStore::new(args.out.join("status"));
    if let Some(update) = status.read(&args.owner, &args.job)? {
        println!("{}", serde_json::to_string_pretty(&update)?);
        return Ok(0);
    }
    // Live record gone or never written; the durable record decides.
    let jobs = JobStore::new(args.out.join("jobs"));
    let job = jobs.load(&args.owner, &args.job)?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(0)
}

fn load_brand(path: &Path) -> Result<BrandIdentity> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading brand file ({})", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("brand file is not valid JSON ({})", path.display()))
}

fn build_controller(out: &Path, dryrun: bool) -> Result<GenerationController> {
    let (copywriter, primary, fallback): (
        Box<dyn CopyGenerator>,
        Box<dyn ImageTaskProvider>,
        Box<dyn ImageTaskProvider>,
    ) = if dryrun {
        (
            Box::new(DryrunCopywriter),
            Box::new(DryrunImageProvider::new(true)),
            Box::new(DryrunImageProvider::new(false)),
        )
    } else {
        (
            Box::new(OpenAiCopywriter::from_env()?),
            Box::new(IdeogramProvider::from_env()?),
            Box::new(ReplicateProvider::from_env()?),
        )
    };

    Ok(GenerationController::new(
        JobStore::new(out.join("jobs")),
        Box::new(FileStatusStore::new(out.join("status"))),
        copywriter,
        BackgroundGenerator::new(primary, fallback),
        Compositor::new(),
        Box::new(FsArtifactStore::new(out.join("posters"))),
    ))
}

#[cfg(test)]
mod tests {
    use posterforge_contracts::ColorTriad;

    use super::*;

    #[test]
    fn dryrun_generate_runs_a_job_end_to_end() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let controller = build_controller(temp.path(), true)?;
        let brand = BrandIdentity {
            name: "Acme".to_string(),
            colors: ColorTriad::default(),
            logo: None,
            tone: None,
        };
        let brief = ContentBrief {
            theme: "launch".to_string(),
            occasion: None,
            instructions: None,
        };
        let job = controller.create_job("local", brand, brief, AspectRatio::Square)?;
        let finished = controller.run("local", &job.job_id, &CancelToken::new())?;
        assert_eq!(finished.status, JobStatus::Complete);
        assert!(finished
            .artifact
            .as_deref()
            .is_some_and(|path| Path::new(path).exists()));
        Ok(())
    }

    #[test]
    fn load_brand_rejects_malformed_json() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("brand.json");
        std::fs::write(&path, "{ not json")?;
        assert!(load_brand(&path).is_err());
        assert!(load_brand(&temp.path().join("missing.json")).is_err());
        Ok(())
    }

    #[test]
    fn load_brand_parses_a_full_identity() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("brand.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "name": "Crumb & Crust",
                "colors": {
                    "primary": "#1f2937",
                    "secondary": "#f9fafb",
                    "accent": "#f59e0b",
                },
                "tone": "warm",
            })
            .to_string(),
        )?;
        let brand = load_brand(&path)?;
        assert_eq!(brand.name, "Crumb & Crust");
        assert_eq!(brand.colors.accent, "#f59e0b");
        assert!(brand.logo.is_none());
        Ok(())
    }
}
