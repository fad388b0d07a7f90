use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use fpipe_adapters::{read_manifest, Assets, FmssPageSource, Locations, RecordKind};
use fpipe_storage::{ExportStore, HttpFetcher};
use fpipe_sync::{
    check_manifest, export_facilities, export_photo_lookup, load_new_photos, make_web_photos, resolve_parks,
    run_reconciliation, ExportTarget, FacilityExportSummary, LoadOutcome, PgAttachmentStore, PipelineConfig,
    WebPhotoStyle,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fpipe")]
#[command(about = "AKR facility photo pipeline")]
struct Cli {
    /// Photo tree containing ORIGINAL and WEB (overrides PHOTOS_ROOT).
    #[arg(long, global = true)]
    photos_root: Option<PathBuf>,
    /// Photo load manifest (overrides PHOTO_MANIFEST).
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Export FMSS location records.
    Locations(FacilityArgs),
    /// Export FMSS asset records.
    Assets(FacilityArgs),
    /// Compare photos in the database, the manifest and the ORIGINAL folder.
    Reconcile,
    /// List manifest rows whose photo is missing from the ORIGINAL folder.
    CheckManifest,
    /// Add the manifest photos to the database in a new edit version.
    AddPhotos,
    /// Write the feature id to photo lookup as JSON.
    PhotosJson {
        #[arg(long, default_value = "photos.json")]
        out: PathBuf,
    },
    /// Create annotated web photos for new originals.
    WebPhotos,
}

#[derive(Debug, Args)]
struct FacilityArgs {
    /// Park unit code; repeat for several parks. Defaults to every known park.
    #[arg(long = "park")]
    parks: Vec<String>,
    /// Write CSV to this path instead of printing rows.
    #[arg(long)]
    csv: Option<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_facility_summary(summary: &FacilityExportSummary) {
    if let Some(text) = &summary.plain_text {
        print!("{text}");
    }
    for failure in &summary.failures {
        eprintln!(
            "Unable to retrieve {} page {} for {} ({})",
            summary.label, failure.page, failure.park, failure.message
        );
    }
    if let Some(written) = &summary.written {
        println!(
            "{} export complete: parks={} records={} skipped={} path={} sha256={} replaced={}",
            summary.label,
            summary.parks,
            summary.records,
            summary.skipped_items,
            written.path.display(),
            written.sha256,
            written.replaced
        );
    }
}

async fn export_kind<K: RecordKind>(
    config: &PipelineConfig,
    args: FacilityArgs,
    url: &str,
) -> Result<FacilityExportSummary> {
    let tables = config.lookup_tables()?;
    let parks = resolve_parks(&tables, &args.parks);
    let http = HttpFetcher::new(config.http_client_config())?;
    let exports = ExportStore::new(".");
    let target = match args.csv {
        Some(path) => ExportTarget::Csv(path),
        None => ExportTarget::Stdout,
    };

    let source = FmssPageSource::new(http, url.to_string());
    export_facilities::<K, _>(&source, &tables, &parks, &target, &exports).await
}

async fn connect(config: &PipelineConfig) -> Result<PgAttachmentStore> {
    Ok(PgAttachmentStore::connect(&config.database_url, &config.web_base_url).await?)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = PipelineConfig::from_env();
    if let Some(root) = cli.photos_root {
        config.photos_root = root;
    }
    if let Some(manifest) = cli.manifest {
        config.manifest_path = manifest;
    }

    match cli.command {
        Commands::Locations(args) => {
            let summary = export_kind::<Locations>(&config, args, &config.locations_url).await?;
            print_facility_summary(&summary);
        }
        Commands::Assets(args) => {
            let summary = export_kind::<Assets>(&config, args, &config.assets_url).await?;
            print_facility_summary(&summary);
        }
        Commands::Reconcile => {
            let mut store = connect(&config).await?;
            let report = run_reconciliation(&mut store, &config.manifest_path, &config.original_dir()).await?;
            print!("{}", report.render());
        }
        Commands::CheckManifest => {
            let report = check_manifest(&config.manifest_path, &config.original_dir())?;
            println!("{}", report.render());
        }
        Commands::AddPhotos => {
            let photos = read_manifest(&config.manifest_path)?;
            if photos.is_empty() {
                println!("There are no photos to add");
                return Ok(());
            }
            let mut store = connect(&config).await?;
            let today = chrono::Local::now().date_naive();
            match load_new_photos(&mut store, &photos, &config.web_base_url, today).await? {
                LoadOutcome::NothingToLoad => println!("There are no photos to add"),
                LoadOutcome::Loaded { version, inserted } => {
                    println!("add-photos complete: version={version} inserted={inserted}")
                }
            }
        }
        Commands::PhotosJson { out } => {
            let mut store = connect(&config).await?;
            let exports = ExportStore::new(".");
            let export = export_photo_lookup(&mut store, &exports, &out).await?;
            println!(
                "photos-json complete: features={} photos={} path={} sha256={} replaced={}",
                export.features,
                export.photos,
                export.file.path.display(),
                export.file.sha256,
                export.file.replaced
            );
        }
        Commands::WebPhotos => {
            let original_dir = config.original_dir();
            if !original_dir.exists() {
                println!("Photo directory: {} does not exist.", original_dir.display());
                return Ok(());
            }
            let style = WebPhotoStyle::load(&config.web_photo_font)?;
            let mut store = connect(&config).await?;
            info!(root = %config.photos_root.display(), "generating web photos");
            let summary = make_web_photos(&mut store, &original_dir, &config.web_dir(), &style).await?;
            println!(
                "web-photos complete: folders={} created={} up_to_date={} unmatched={} failed={}",
                summary.folders, summary.created, summary.up_to_date, summary.unmatched, summary.failed
            );
        }
    }

    Ok(())
}
