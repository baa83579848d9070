use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};
use revscrape_browser::{ChromiumConfig, ChromiumRenderer, HttpRenderer};
use revscrape_crawler::{
    cancellation, crawl_listings, CrawlSummary, CrawlerConfig, Listing, RecordSink, Renderer,
    Site, Termination,
};
use revscrape_sites::{preset, CsvSink, Preset, PRESETS};
use tokio::runtime;

const DEFAULT_LOG_FILTER: &str =
    "revscrape=info,revscrape_crawler=info,revscrape_browser=info,revscrape_sites=info";

/// Paginated review scraper
#[derive(Debug, Parser)]
#[clap(version)]
pub struct Args {
    #[clap(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum SubCommand {
    #[clap(name = "crawl")]
    Crawl(CrawlArgs),
    #[clap(name = "extract")]
    Extract(ExtractArgs),
    #[clap(name = "presets")]
    Presets(PresetsArgs),
    #[clap(hide = true)]
    Completion,
}

#[derive(Debug, clap::Args)]
#[clap(group = clap::ArgGroup::new("site-source").required(true))]
pub struct SiteArgs {
    /// Built-in site preset (see `revscrape presets`)
    #[clap(group = "site-source", long)]
    pub site: Option<String>,
    /// Path to a site yaml configuration file
    #[clap(group = "site-source", parse(from_os_str), long)]
    pub site_config: Option<PathBuf>,
}

impl SiteArgs {
    fn load(&self) -> anyhow::Result<Preset> {
        match (&self.site, &self.site_config) {
            (Some(name), _) => preset(name).ok_or_else(|| {
                anyhow::anyhow!("Unknown preset {name:?}, available: {}", PRESETS.join(", "))
            }),
            (None, Some(path)) => Preset::load(path),
            (None, None) => anyhow::bail!("Missing `site` or `site-config`"),
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ArgEnum)]
pub enum RendererKind {
    /// Headless (or headed) Chromium, for script-rendered pages
    Chromium,
    /// Plain HTTP, for server-rendered pages paginated with links
    Http,
}

/// Crawl review listings page by page
#[derive(Debug, clap::Args)]
pub struct CrawlArgs {
    #[clap(flatten)]
    pub site: SiteArgs,
    /// Listing to crawl, overrides the site's listing URLs (repeatable)
    #[clap(long)]
    pub url: Vec<String>,
    /// Path to the output CSV file, suffixed with -1, -2... for several listings
    #[clap(parse(from_os_str), long, short)]
    pub output_file: PathBuf,
    /// Optional default crawler yaml configuration file
    #[clap(env = "REVSCRAPE_CRAWLER_CONFIG", parse(from_os_str), long)]
    pub crawler_config: Option<PathBuf>,
    /// Override crawler's maximum number of pages per listing
    #[clap(long)]
    pub max_pages: Option<NonZeroUsize>,
    /// Override crawler's maximum wait for a challenge to be solved, in seconds
    #[clap(long)]
    pub guard_max_wait: Option<f32>,
    /// Override crawler's maximum number of listings crawled at once
    #[clap(long)]
    pub max_concurrent_listings: Option<usize>,
    /// Keep records whose every field is absent
    #[clap(long)]
    pub keep_empty_records: bool,
    #[clap(arg_enum, long, default_value = "chromium")]
    pub renderer: RendererKind,
    /// Show the browser window, required to solve challenges by hand
    #[clap(long)]
    pub headed: bool,
    /// Path to the Chrome or Chromium executable
    #[clap(parse(from_os_str), long)]
    pub chrome: Option<PathBuf>,
    /// Custom user agent
    #[clap(long)]
    pub user_agent: Option<String>,
    /// No SIGINT handling, pages in flight are lost on Ctrl-C
    #[clap(long)]
    pub no_sigint: bool,
    /// When quiet no logs are outputted
    #[clap(long, short)]
    pub quiet: bool,
    /// Write logs to this file instead of stderr
    #[clap(parse(from_os_str), long)]
    pub log_file: Option<PathBuf>,
}

impl TryFrom<&CrawlArgs> for CrawlerConfig {
    type Error = anyhow::Error;

    fn try_from(args: &CrawlArgs) -> Result<Self, Self::Error> {
        let mut conf = if let Some(path) = &args.crawler_config {
            serde_yaml::from_reader(fs_err::File::open(path)?)
                .with_context(|| format!("Invalid crawler config {}", path.display()))?
        } else {
            CrawlerConfig::default()
        };
        if let Some(max_pages) = args.max_pages {
            conf.max_pages = Some(max_pages);
        }
        if let Some(guard_max_wait) = args.guard_max_wait {
            conf.guard_max_wait = guard_max_wait;
        }
        if let Some(max_concurrent_listings) = args.max_concurrent_listings {
            conf.max_concurrent_listings = max_concurrent_listings;
        }
        if args.keep_empty_records {
            conf.keep_empty_records = true;
        }
        if args.no_sigint {
            conf.handle_sigint = false;
        }
        conf.validate().context("Invalid crawler config")?;
        Ok(conf)
    }
}

pub fn crawl(args: CrawlArgs) -> anyhow::Result<ExitCode> {
    let crawler_conf: CrawlerConfig = (&args).try_into()?;
    let preset = args.site.load()?;
    let site = Site::compile(&preset.site, &crawler_conf)?;

    let urls = if args.url.is_empty() {
        preset.site.listing_urls.clone()
    } else {
        args.url.clone()
    };
    if urls.is_empty() {
        anyhow::bail!("No listing to crawl, use --url or set listingUrls in the site config");
    }

    let columns = site.columns();
    let listings = urls
        .iter()
        .enumerate()
        .map(|(i, url)| {
            let path = CsvSink::numbered_path(&args.output_file, i + 1, urls.len());
            let sink: Box<dyn RecordSink> =
                Box::new(CsvSink::create(&path, &columns, &preset.csv)?);
            Ok(Listing {
                url: url.clone(),
                sink,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let summaries = rt.block_on(async {
        let (handle, cancel) = cancellation();
        if crawler_conf.handle_sigint {
            handle.cancel_on_ctrl_c();
        }

        let renderer: Box<dyn Renderer> = match args.renderer {
            RendererKind::Chromium => Box::new(
                ChromiumRenderer::launch(&ChromiumConfig {
                    headless: !args.headed,
                    executable: args.chrome.clone(),
                    user_agent: args.user_agent.clone(),
                    ..Default::default()
                })
                .await?,
            ),
            RendererKind::Http => Box::new(HttpRenderer::new(
                args.user_agent.as_deref(),
                Duration::from_secs(30),
            )?),
        };

        let summaries =
            crawl_listings(&crawler_conf, &site, renderer.as_ref(), listings, &cancel).await;
        if let Err(e) = renderer.shutdown().await {
            log::warn!("Couldn't shut the renderer down: {e:#}");
        }
        anyhow::Ok(summaries)
    })?;

    Ok(exit_code(&summaries))
}

fn exit_code(summaries: &[CrawlSummary]) -> ExitCode {
    if summaries.iter().any(CrawlSummary::is_fatal) {
        ExitCode::from(2)
    } else if summaries
        .iter()
        .any(|s| s.termination == Termination::Cancelled)
    {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    }
}

/// Extract the reviews of a single page and print them to stdout as CSV
#[derive(Debug, clap::Args)]
#[clap(group = clap::ArgGroup::new("page").required(true))]
pub struct ExtractArgs {
    #[clap(flatten)]
    pub site: SiteArgs,
    /// A local html page to extract
    #[clap(group = "page", parse(from_os_str), long)]
    pub file: Option<PathBuf>,
    /// A distant html page to extract
    #[clap(group = "page", long)]
    pub url: Option<String>,
    /// Custom user agent to download the page
    #[clap(long, conflicts_with = "file")]
    pub ua: Option<String>,
    /// Keep records whose every field is absent
    #[clap(long)]
    pub keep_empty_records: bool,
}

pub fn extract(args: ExtractArgs) -> anyhow::Result<()> {
    let preset = args.site.load()?;
    let site = Site::compile(&preset.site, &CrawlerConfig::default())?;

    let page = if let Some(url) = &args.url {
        let mut builder = reqwest::blocking::ClientBuilder::new();
        if let Some(ua) = &args.ua {
            builder = builder.user_agent(ua);
        }
        let client = builder.build()?;
        client.get(url).send()?.error_for_status()?.text()?
    } else if let Some(path) = &args.file {
        fs_err::read_to_string(path)?
    } else {
        anyhow::bail!("Missing `url` or `file`");
    };

    let batch = site.extract_page(&page, args.keep_empty_records);
    log::info!(
        "{} records extracted, {} empty containers discarded",
        batch.len(),
        batch.discarded
    );
    let mut sink = CsvSink::stdout(&site.columns(), &preset.csv)?;
    sink.append(&batch.records)
}

/// List built-in site presets or print one as yaml
#[derive(Debug, clap::Args)]
pub struct PresetsArgs {
    /// Preset to print
    pub name: Option<String>,
}

pub fn presets(args: PresetsArgs) -> anyhow::Result<()> {
    let mut stdout = io::stdout();
    match args.name {
        None => {
            for name in PRESETS {
                writeln!(stdout, "{name}")?;
            }
        }
        Some(name) => {
            let preset = preset(&name).ok_or_else(|| anyhow::anyhow!("Unknown preset {name:?}"))?;
            write!(stdout, "{}", preset.to_yaml()?)?;
        }
    }
    Ok(())
}

fn init_logger(quiet: bool, log_file: Option<&Path>, filter: &str) -> anyhow::Result<()> {
    if quiet {
        return Ok(());
    }
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter));
    builder.format_timestamp_secs();
    if let Some(path) = log_file {
        let file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

fn run(args: Args) -> anyhow::Result<ExitCode> {
    match args.cmd {
        SubCommand::Crawl(args) => {
            init_logger(args.quiet, args.log_file.as_deref(), DEFAULT_LOG_FILTER)?;
            crawl(args)
        }
        SubCommand::Extract(args) => {
            init_logger(false, None, "revscrape=info,revscrape_crawler=warn")?;
            extract(args)?;
            Ok(ExitCode::SUCCESS)
        }
        SubCommand::Presets(args) => {
            presets(args)?;
            Ok(ExitCode::SUCCESS)
        }
        SubCommand::Completion => {
            generate(Shell::Bash, &mut Args::command(), "revscrape", &mut io::stdout());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::from(2)
        }
    }
}
