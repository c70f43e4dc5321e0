use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use updater_core::{
    ActivationState, Backends, DigestVerifier, FlashLayout, FsFlashHelper, FsPersistStore,
    FsUploadManager, ItemUpdater, RequestedActivation, SystemctlUnits, UpdaterConfig,
    UploadNotification, VersionId,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "BMC firmware image manager", long_about = None)]
struct Args {
    /// Path to the updater configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log unit commands instead of running them
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List installed and uploaded images
    List,
    /// Register and activate an unpacked image directory
    Install {
        /// Directory holding the image files and their MANIFEST
        dir: PathBuf,
    },
    /// Set the redundancy priority of an image (0 boots first)
    Priority {
        #[arg(value_parser = VersionId::parse)]
        id: VersionId,
        value: u8,
    },
    /// Delete an image
    Erase {
        #[arg(value_parser = VersionId::parse)]
        id: VersionId,
    },
    /// Delete every image except the running one
    DeleteAll,
    /// Enable field mode (cannot be undone)
    FieldMode,
    /// Reset the BMC to factory defaults on the next boot
    FactoryReset,
    /// Write the default configuration to a file
    InitConfig { path: PathBuf },
}

fn load_config(path: Option<&Path>, dry_run: bool) -> Result<UpdaterConfig> {
    let mut config = match path {
        Some(path) => UpdaterConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => UpdaterConfig::default(),
    };
    if dry_run {
        config.dry_run_units = true;
    }
    if config.layout != FlashLayout::Static {
        bail!(
            "layout {} needs a flash service; this tool writes the static layout only",
            config.layout
        );
    }
    Ok(config)
}

fn open_updater(config: UpdaterConfig) -> Result<ItemUpdater> {
    let mut signed_files = config.full_image_files.clone();
    signed_files.extend(config.split_image_files.iter().cloned());

    let backends = Backends {
        flash: Box::new(FsFlashHelper::new(
            config.media_dir.clone(),
            &config.rofs_prefix,
            config.boot_env_file(),
        )),
        units: Arc::new(SystemctlUnits::new(config.dry_run_units)),
        uploads: Box::new(FsUploadManager::new(config.upload_dir.clone())),
        store: Box::new(FsPersistStore::new(config.persist_dir())),
        signature: Some(Box::new(DigestVerifier::new(signed_files))),
    };

    let mut updater = ItemUpdater::new(config, backends)?;
    updater.restore_field_mode_status()?;
    updater.process_bmc_image()?;
    Ok(updater)
}

/// Stage an image directory in the upload area, as the upload service would.
fn stage_upload(dir: &Path, upload_dir: &Path) -> Result<UploadNotification> {
    let manifest = UploadNotification::from_manifest(dir)
        .with_context(|| format!("reading manifest in {}", dir.display()))?;
    let staged = upload_dir.join(manifest.id.as_str());
    fs::create_dir_all(&staged)?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), staged.join(entry.file_name()))?;
        }
    }
    Ok(UploadNotification {
        path: staged,
        ..manifest
    })
}

fn list(updater: &ItemUpdater) {
    println!(
        "{:<10} {:<24} {:<8} {:<11} {:>8}  FUNCTIONAL",
        "ID", "VERSION", "PURPOSE", "STATE", "PRIORITY"
    );
    for record in updater.versions() {
        let activation = updater.activation(&record.id);
        let state = activation.map(|a| a.state.to_string()).unwrap_or_default();
        let priority = activation
            .and_then(|a| a.redundancy_priority)
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<10} {:<24} {:<8} {:<11} {:>8}  {}",
            record.id.to_string(),
            record.version,
            record.purpose.to_string(),
            state,
            priority,
            if record.functional { "yes" } else { "" }
        );
    }
    if let Some(bios) = updater.bios() {
        let version = if bios.version.is_empty() {
            "unknown"
        } else {
            bios.version.as_str()
        };
        println!("host BIOS: {version}");
    }
}

fn run(args: Args) -> Result<()> {
    let Args {
        config,
        dry_run,
        command,
        ..
    } = args;

    if let Command::InitConfig { path } = &command {
        UpdaterConfig::default().save_to_file(path)?;
        info!(path = %path.display(), "Default configuration written");
        return Ok(());
    }

    let config = load_config(config.as_deref(), dry_run)?;
    let upload_dir = config.upload_dir.clone();
    let mut updater = open_updater(config)?;

    match command {
        Command::List => list(&updater),
        Command::Install { dir } => {
            let upload = stage_upload(&dir, &upload_dir)?;
            let id = upload.id.clone();
            match updater.register_image(upload) {
                None => bail!("image {id} was not accepted (unsupported purpose or already known)"),
                Some(ActivationState::Invalid) => bail!("image {id} is missing required files"),
                Some(_) => {}
            }
            let state = updater.set_requested_activation(&id, RequestedActivation::Active)?;
            info!(id = %id, state = %state, "Activation finished");
            println!("{id} {state}");
        }
        Command::Priority { id, value } => {
            updater.set_priority(&id, value)?;
            println!("{id} priority {value}");
        }
        Command::Erase { id } => {
            if !updater.contains(&id) {
                warn!(id = %id, "Version not registered, cleaning up storage only");
            }
            updater.erase(&id)?;
        }
        Command::DeleteAll => {
            let erased = updater.delete_all();
            println!("erased {erased} image(s)");
        }
        Command::FieldMode => {
            updater.set_field_mode(true)?;
            println!("field mode enabled");
        }
        Command::FactoryReset => updater.factory_reset()?,
        // Handled before the updater is opened.
        Command::InitConfig { .. } => {}
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    run(args)
}
