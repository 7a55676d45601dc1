use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Instant;
use tracing::{info, warn};

use certidao_cli::captcha::{
    AcceptancePolicy, CaptchaImage, CaptchaStrategy, ConfiguredSolver, RemoteSolverClient,
};
use certidao_cli::config::{RemoteConfig, SolverConfig, Strategy};
use certidao_cli::driver::BrowserSession;
use certidao_cli::ledger::Ledger;
use certidao_cli::portal::{builtin_profiles, find_profile, ChallengeKind, PortalRunner, RunSummary};

const DEFAULT_WEBDRIVER_URL: &str = "http://localhost:9515";

struct RunReport {
    portal: String,
    summary: RunSummary,
    duration_secs: f64,
    success_rate: f64,
}

impl RunReport {
    fn new(portal: &str, summary: RunSummary, duration_secs: f64) -> Self {
        let success_rate = if summary.processed > 0 {
            (summary.succeeded as f64 / summary.processed as f64) * 100.0
        } else {
            0.0
        };

        Self {
            portal: portal.to_string(),
            summary,
            duration_secs,
            success_rate,
        }
    }

    fn format_duration(&self) -> String {
        let total_secs = self.duration_secs as u64;
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let seconds = total_secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, minutes, seconds)
        } else if minutes > 0 {
            format!("{}m {}s", minutes, seconds)
        } else {
            format!("{}s", seconds)
        }
    }

    fn display(&self) {
        println!("\n╔══════════════════════════════════════════════════════════╗");
        println!("║              CERTIFICATE RUN REPORT                      ║");
        println!("╠══════════════════════════════════════════════════════════╣");
        println!("║  Portal:                  {:>30} ║", self.portal);
        println!("║  Processed:               {:>30} ║", self.summary.processed);
        println!("║  Successful:              {:>30} ║", self.summary.succeeded);
        println!("║  Failed:                  {:>30} ║", self.summary.failed);
        println!(
            "║  Duration:                {:>30} ║",
            self.format_duration()
        );
        println!(
            "║  Success Rate:            {:>27.1}%   ║",
            self.success_rate
        );
        println!("╚══════════════════════════════════════════════════════════╝\n");
    }
}

#[derive(Parser)]
#[command(name = "certidao")]
#[command(about = "Fetch tax clearance certificates, solving their captchas", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve a saved captcha image once and print the guess.
    Solve {
        image: PathBuf,

        #[arg(short, long)]
        strategy: Option<Strategy>,

        /// Known answer length; 0 disables length checks.
        #[arg(long = "expected-len")]
        expected_len: Option<usize>,

        /// Answer is the result of a sum such as `12+7=`.
        #[arg(long, default_value_t = false)]
        arithmetic: bool,

        #[arg(long = "min-confidence")]
        min_confidence: Option<f64>,
    },

    /// Fetch a certificate for every document in a ledger.
    Run {
        #[arg(short, long)]
        portal: String,

        #[arg(short, long)]
        ledger: PathBuf,

        #[arg(long = "out-dir", default_value = "certidoes_baixadas")]
        out_dir: PathBuf,

        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        headless: bool,

        #[arg(long = "webdriver-url")]
        webdriver_url: Option<String>,

        #[arg(short, long)]
        strategy: Option<Strategy>,

        #[arg(long = "record-attempts", default_value_t = 3)]
        record_attempts: u32,

        /// Start a local chromedriver before connecting.
        #[arg(long = "spawn-chromedriver", default_value_t = false)]
        spawn_chromedriver: bool,
    },

    /// List the built-in portals.
    Portals,

    /// Show the remote solver account balance.
    Balance,
}

fn start_chromedriver(webdriver_url: &str) -> Result<Child> {
    let port = webdriver_url
        .rsplit(':')
        .next()
        .and_then(|p| p.trim_end_matches('/').parse::<u16>().ok())
        .unwrap_or(9515);

    info!("Attempting to start ChromeDriver on port {}...", port);
    let child = Command::new("chromedriver")
        .arg(format!("--port={}", port))
        .spawn()
        .context("Failed to start chromedriver. Is it installed and on PATH?")?;

    // chromedriver needs a moment before it accepts sessions
    std::thread::sleep(std::time::Duration::from_secs(2));
    info!("ChromeDriver started (pid {})", child.id());
    Ok(child)
}

async fn solve_image(path: &Path, config: &SolverConfig, remote: Option<&RemoteConfig>) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let image = CaptchaImage::from_bytes(bytes)?;
    let (width, height) = image.dimensions();
    info!("Loaded {:?} ({}x{})", path, width, height);

    let solver = ConfiguredSolver::from_config(config, remote)?;
    info!("Solving with the {} strategy", solver.strategy());

    let started = Instant::now();
    let guess = solver.attempt(&image).await?;
    let accepted = AcceptancePolicy::from_config(config).accepts(&guess);

    println!("\n{:<12} {}", "Answer:", guess.text);
    println!("{:<12} {:.1}", "Confidence:", guess.confidence);
    println!("{:<12} {:.1}", "Score:", guess.aggregate_score);
    println!("{:<12} {:?}", "Source:", guess.source);
    println!(
        "{:<12} {}",
        "Accepted:",
        if accepted { "yes" } else { "no" }
    );
    println!("{:<12} {:.2}s\n", "Took:", started.elapsed().as_secs_f64());
    Ok(())
}

/// Applies `solve` flags over the environment config. An arithmetic answer
/// has no fixed length unless `--expected-len` gives one.
fn solve_config(
    mut config: SolverConfig,
    strategy: Option<Strategy>,
    expected_len: Option<usize>,
    arithmetic: bool,
    min_confidence: Option<f64>,
) -> Result<SolverConfig> {
    if let Some(strategy) = strategy {
        config.strategy = strategy;
    }
    if arithmetic {
        config.arithmetic = true;
        config.expected_length = None;
    }
    if let Some(len) = expected_len {
        config.expected_length = Some(len).filter(|l| *l > 0);
    }
    if let Some(value) = min_confidence {
        config.min_confidence = value;
    }
    config.validate()?;
    Ok(config)
}

fn print_portals() {
    println!(
        "\n{:<10} {:<10} {:<9} {:<8} {}",
        "Portal", "Captcha", "Strategy", "Length", "Certificate"
    );
    println!("{}", "-".repeat(100));

    for profile in builtin_profiles() {
        let captcha = match &profile.challenge {
            ChallengeKind::None => "none",
            ChallengeKind::Image(_) => "image",
            ChallengeKind::ReCaptcha => "recaptcha",
            ChallengeKind::HCaptcha => "hcaptcha",
        };
        let length = profile
            .expected_length
            .map(|l| l.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:<10} {:<9} {:<8} {}",
            profile.name,
            captcha,
            profile.strategy.to_string(),
            length,
            profile.title
        );
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    dotenv::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Solve {
            image,
            strategy,
            expected_len,
            arithmetic,
            min_confidence,
        } => {
            let config = solve_config(
                SolverConfig::from_env()?,
                strategy,
                expected_len,
                arithmetic,
                min_confidence,
            )?;

            let remote = RemoteConfig::from_env()?;
            solve_image(&image, &config, remote.as_ref()).await?;
        }

        Commands::Run {
            portal,
            ledger,
            out_dir,
            headless,
            webdriver_url,
            strategy,
            record_attempts,
            spawn_chromedriver,
        } => {
            let start_time = Instant::now();
            let profile = find_profile(&portal)?;
            let mut config = profile.solver_config(&SolverConfig::from_env()?);
            if let Some(strategy) = strategy {
                config.strategy = strategy;
            }
            let remote = RemoteConfig::from_env()?;
            if profile.has_captcha() && config.strategy.needs_remote() && remote.is_none() {
                bail!(
                    "{} needs the remote solver: set TWOCAPTCHA_API_KEY or pick --strategy local",
                    profile.name
                );
            }

            let mut ledger = Ledger::open(&ledger)?;
            if ledger.is_empty() {
                info!("Ledger {:?} has no rows. Nothing to process.", ledger.path());
                return Ok(());
            }

            let webdriver_url = webdriver_url
                .or_else(|| std::env::var("WEBDRIVER_URL").ok())
                .unwrap_or_else(|| DEFAULT_WEBDRIVER_URL.to_string());
            let mut chromedriver = if spawn_chromedriver {
                Some(start_chromedriver(&webdriver_url)?)
            } else {
                None
            };

            let portal_dir = out_dir.join(profile.name);
            let download_dir = portal_dir.join(".downloads");
            std::fs::create_dir_all(&download_dir)
                .with_context(|| format!("Failed to create {:?}", download_dir))?;

            info!(
                "Connecting to WebDriver at {} (headless: {})",
                webdriver_url, headless
            );
            let session = BrowserSession::launch(&webdriver_url, headless, &download_dir).await?;
            let name = profile.name;

            let result = match PortalRunner::new(
                &session,
                profile,
                config,
                remote.as_ref(),
                portal_dir,
            ) {
                Ok(runner) => {
                    runner
                        .with_record_attempts(record_attempts)
                        .run(&mut ledger)
                        .await
                }
                Err(e) => Err(e),
            };

            if let Err(e) = session.quit().await {
                warn!("Failed to close browser: {:#}", e);
            }
            if let Some(child) = chromedriver.as_mut() {
                child.kill().ok();
            }

            let summary = result?;
            RunReport::new(name, summary, start_time.elapsed().as_secs_f64()).display();
        }

        Commands::Portals => print_portals(),

        Commands::Balance => {
            let Some(client) = RemoteSolverClient::from_env()? else {
                bail!("TWOCAPTCHA_API_KEY is not set");
            };
            let balance = client.balance().await?;
            println!("2Captcha balance: ${:.4}", balance);
        }
    }

    Ok(())
}
