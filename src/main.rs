use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dupsieve::{
    Deadline, DuplicateFunnel, EmbedError, EmbeddingProvider, FunnelConfig, ItemId,
    PrecomputedEmbeddings, ScannerService, SourceImage, Stage, Verdict, load_image,
    read_manifest,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "dupsieve",
    version,
    about = "Near-duplicate image detection: hash sieve, then embedding verifier"
)]
struct Cli {
    /// Log debug detail to stderr (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build or inspect the reference index
    Index {
        #[command(subcommand)]
        command: IndexCmd,
    },

    /// Check one image against the reference index
    Detect {
        /// Image to check
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
        /// JSON Lines file of precomputed embeddings
        #[arg(long, value_name = "FILE")]
        embeddings: Option<PathBuf>,
        /// Index directory (default: local data dir)
        #[arg(long, value_name = "DIR")]
        index: Option<PathBuf>,
        /// Print the verdict as JSON
        #[arg(long)]
        json: bool,
        /// Give up after this many milliseconds
        #[arg(long, value_name = "N")]
        timeout_ms: Option<u64>,
        #[command(flatten)]
        tuning: TuningArgs,
    },

    /// Compare two images directly, without an index
    Compare {
        #[arg(value_name = "A")]
        a: PathBuf,
        #[arg(value_name = "B")]
        b: PathBuf,
        /// JSON Lines file of precomputed embeddings
        #[arg(long, value_name = "FILE")]
        embeddings: Option<PathBuf>,
        #[command(flatten)]
        tuning: TuningArgs,
    },
}

#[derive(Subcommand, Debug)]
enum IndexCmd {
    /// Fingerprint every image under a directory and save the index
    Build {
        /// Directory of reference images
        #[arg(long, value_name = "DIR")]
        images: PathBuf,
        /// JSON Lines file of precomputed embeddings
        #[arg(long, value_name = "FILE")]
        embeddings: Option<PathBuf>,
        /// Index directory (default: local data dir)
        #[arg(long, value_name = "DIR")]
        index: Option<PathBuf>,
        #[command(flatten)]
        tuning: TuningArgs,
    },

    /// Show what a saved index holds
    Info {
        /// Index directory (default: local data dir)
        #[arg(long, value_name = "DIR")]
        index: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Profile {
    /// Hamming <= 15, cosine >= 0.2
    Lenient,
    /// Hamming <= 5, cosine >= 0.65
    Strict,
}

#[derive(Args, Debug)]
struct TuningArgs {
    /// JSON config file; flags below override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Threshold preset used when no config file is given
    #[arg(long, value_enum)]
    profile: Option<Profile>,
    #[arg(long, value_name = "BITS")]
    hash_threshold: Option<u32>,
    #[arg(long, value_name = "COSINE")]
    similarity_threshold: Option<f32>,
    #[arg(long, value_name = "K")]
    top_k: Option<usize>,
}

impl TuningArgs {
    fn resolve(&self, fallback: Profile) -> Result<FunnelConfig> {
        let mut config = match &self.config {
            Some(path) => FunnelConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => match self.profile.unwrap_or(fallback) {
                Profile::Lenient => FunnelConfig::lenient(),
                Profile::Strict => FunnelConfig::strict(),
            },
        };
        if let Some(t) = self.hash_threshold {
            config.hash_threshold = t;
        }
        if let Some(t) = self.similarity_threshold {
            config.similarity_threshold = t;
        }
        if let Some(k) = self.top_k {
            config.top_k = k;
        }
        config.validate().context("Invalid funnel configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Index { command } => match command {
            IndexCmd::Build {
                images,
                embeddings,
                index,
                tuning,
            } => {
                let config = tuning.resolve(Profile::Lenient)?;
                let index_dir = index_dir(index)?;
                let embeddings = load_embeddings(embeddings.as_deref())?;

                println!("▶ Indexing images in: {}", images.display());
                let mut funnel = DuplicateFunnel::new(config)?;

                let bar = ProgressBar::new(0);
                bar.set_style(ProgressStyle::with_template(
                    "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                )?);
                bar.set_message("fingerprinting…");
                bar.enable_steady_tick(Duration::from_millis(100));

                let scanner = ScannerService::new().with_progress(bar.clone());
                let report = benchmark("indexing all images", || {
                    scanner.build(&mut funnel, &images, embeddings.as_ref())
                })
                .with_context(|| format!("Failed to scan {}", images.display()))?;
                bar.finish_with_message("done");

                for skipped in &report.skipped {
                    println!("   ⚠️  Skipped {}: {}", skipped.path.display(), skipped.reason);
                }

                funnel
                    .save(&index_dir)
                    .with_context(|| format!("Failed to save index to {}", index_dir.display()))?;

                println!(
                    "✅ Indexed {} of {} images ({} with embeddings, {} skipped) into {}",
                    report.indexed,
                    report.discovered,
                    funnel.vectors().len(),
                    report.skipped.len(),
                    index_dir.display()
                );
            }

            IndexCmd::Info { index } => {
                let index_dir = index_dir(index)?;
                let (sieve, vectors) = DuplicateFunnel::load_indexes(&index_dir)
                    .with_context(|| format!("Could not open index {}", index_dir.display()))?;
                let manifest = read_manifest(&index_dir)
                    .with_context(|| format!("Could not read manifest in {}", index_dir.display()))?;

                println!("🗂️  Index: {}", index_dir.display());
                println!("   saved: {}", manifest.saved_at.to_rfc3339());
                println!(
                    "   fingerprints: {} ({} bits)",
                    sieve.len(),
                    sieve.width().unwrap_or(0)
                );
                match vectors.dimension() {
                    Some(dimension) => println!("   vectors: {} x {}", vectors.len(), dimension),
                    None => println!("   vectors: none"),
                }
            }
        },

        Commands::Detect {
            image,
            embeddings,
            index,
            json,
            timeout_ms,
            tuning,
        } => {
            let config = tuning.resolve(Profile::Lenient)?;
            let index_dir = index_dir(index)?;
            let embeddings = load_embeddings(embeddings.as_deref())?;

            let funnel = DuplicateFunnel::load(&index_dir, config)
                .with_context(|| format!("Could not load index {}", index_dir.display()))?;
            let query = load_image(&image)
                .with_context(|| format!("Failed to load {}", image.display()))?;
            let id = ItemId::from_path(&image);
            let source = SourceImage::with_id(&query, &id);

            let deadline = timeout_ms
                .map(|ms| Deadline::after(Duration::from_millis(ms)))
                .unwrap_or_default();

            let run = || {
                let fingerprint = funnel.fingerprint(&query);
                funnel.detect_fingerprint(&fingerprint, Some(&id), deadline, || {
                    match &embeddings {
                        Some(provider) => provider.embed(&source),
                        // An empty verifier needs no query vector.
                        None if funnel.vectors().is_empty() => Ok(Vec::new()),
                        None => Err(EmbedError::Provider {
                            message: "the sieve found nothing; pass --embeddings to run the verifier"
                                .to_string(),
                        }),
                    }
                })
            };
            // Keep stdout clean for --json.
            let outcome = if json { run() } else { benchmark("detection", run) };
            let verdict = outcome.map_err(|e| {
                let class = e.class();
                anyhow::Error::new(e).context(format!("Detection failed ({:?})", class))
            })?;

            if json {
                println!("{}", serde_json::to_string_pretty(&verdict.report())?);
            } else {
                print_verdict(&image, &verdict);
            }
        }

        Commands::Compare {
            a,
            b,
            embeddings,
            tuning,
        } => {
            let config = tuning.resolve(Profile::Strict)?;
            let embeddings = load_embeddings(embeddings.as_deref())?;
            let funnel = DuplicateFunnel::new(config)?;

            let image_a = load_image(&a).with_context(|| format!("Failed to load {}", a.display()))?;
            let image_b = load_image(&b).with_context(|| format!("Failed to load {}", b.display()))?;

            let pair = match &embeddings {
                Some(provider) => {
                    let id_a = ItemId::from_path(&a);
                    let id_b = ItemId::from_path(&b);
                    let ea = provider.embed(&SourceImage::with_id(&image_a, &id_a))?;
                    let eb = provider.embed(&SourceImage::with_id(&image_b, &id_b))?;
                    funnel.compare(&image_a, &image_b, Some((ea.as_slice(), eb.as_slice())))?
                }
                None => funnel.compare(&image_a, &image_b, None)?,
            };

            println!("▶ {} vs {}", a.display(), b.display());
            println!(
                "   hamming: {} (threshold {})",
                pair.hamming,
                funnel.config().hash_threshold
            );
            if let Some(similarity) = pair.similarity {
                println!(
                    "   cosine: {:.4} (threshold {})",
                    similarity,
                    funnel.config().similarity_threshold
                );
            }
            if pair.is_duplicate() {
                println!("🔁 DUPLICATE");
            } else {
                println!("✅ DIFFERENT");
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn index_dir(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(dir) => Ok(dir),
        None => dirs::data_local_dir()
            .map(|d| d.join("dupsieve"))
            .context("No local data directory on this platform; pass --index"),
    }
}

fn load_embeddings(path: Option<&Path>) -> Result<Option<PrecomputedEmbeddings>> {
    path.map(|p| {
        PrecomputedEmbeddings::from_jsonl(p)
            .with_context(|| format!("Failed to load embeddings {}", p.display()))
    })
    .transpose()
}

fn print_verdict(image: &Path, verdict: &Verdict) {
    println!("▶ {}", image.display());
    match (verdict.stage(), verdict.best_match(), verdict.score()) {
        (Stage::Unique, _, _) => println!("✅ Unique"),
        (stage, Some(matched), Some(score)) => {
            println!("🔁 Duplicate of {} ({} stage, {})", matched, stage, score)
        }
        (stage, _, _) => println!("🔁 Duplicate ({} stage)", stage),
    }

    for m in verdict.sieve_matches() {
        println!("   🔎 {} hamming {}", m.id, m.distance);
    }
    for m in verdict.verifier_matches() {
        println!("   🧠 {} cosine {:.4}", m.id, m.score);
    }
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
