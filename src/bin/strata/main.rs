//! Command-line front end for strata volumes.
#![forbid(unsafe_code)]

mod config;
mod ui;

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use strata::{
    logging::init_logging,
    storage::{Catalog, DeallocList, ObjectHeader, PageSummary, StoreOptions},
    types::{FileId, ObjectId, PageId, PageNo, StrataError},
    volume::Volume,
};
use thiserror::Error;
use tracing::debug;

use crate::config::{CliConfig, ConfigError};
use crate::ui::{Theme, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "strata",
    version,
    about = "Inspect and edit strata object volumes",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(long, global = true, env = "STRATA_VOLUME", help = "Volume file to operate on")]
    volume: Option<PathBuf>,

    #[arg(long, global = true, env = "STRATA_CONFIG", help = "CLI config file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        default_value = "warn",
        help = "Log filter directive (e.g. info, strata=debug)"
    )]
    log_level: String,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(long, global = true, value_enum, default_value_t = Theme::Auto)]
    theme: Theme,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create and format a new volume")]
    Init(InitCmd),

    #[command(about = "Create an empty file and print its serial")]
    CreateFile {
        #[arg(long, help = "Extent fill factor in percent (defaults to the store setting)")]
        fill_factor: Option<u8>,
    },

    #[command(about = "Store an object and print its id")]
    Put(PutCmd),

    #[command(about = "Print an object")]
    Get {
        #[arg(value_name = "OID", help = "Object id as volume:page:slot:unique")]
        oid: ObjectId,
        #[arg(long, help = "Print the payload as hex")]
        hex: bool,
    },

    #[command(about = "Destroy an object and release emptied pages")]
    Del {
        #[arg(long, value_name = "SERIAL", help = "Serial of the owning file")]
        file: u32,
        #[arg(value_name = "OID")]
        oid: ObjectId,
    },

    #[command(about = "List files, or the objects of one file")]
    Ls {
        #[arg(long, value_name = "SERIAL")]
        file: Option<u32>,
    },

    #[command(about = "Show volume geometry or one page header")]
    Inspect {
        #[arg(long, value_name = "PAGE")]
        page: Option<u32>,
    },
}

#[derive(Args, Debug)]
struct InitCmd {
    #[arg(long, help = "Page size in bytes")]
    page_size: Option<u32>,

    #[arg(long, help = "Pages per extent (at most 32)")]
    pages_per_extent: Option<u32>,

    #[arg(long, help = "Volume identifier stamped into every page")]
    volume_id: Option<u16>,
}

#[derive(Args, Debug)]
struct PutCmd {
    #[arg(long, value_name = "SERIAL", help = "Serial of the target file")]
    file: u32,

    #[arg(long, value_name = "OID", help = "Place the object near this one")]
    near: Option<ObjectId>,

    #[arg(long, default_value_t = 0, help = "Object tag stored in the header")]
    tag: u16,

    #[arg(long, help = "DATA is hex encoded")]
    hex: bool,

    #[arg(value_name = "DATA")]
    data: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Store(#[from] StrataError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no volume given; pass --volume or set [volume] default in the config file")]
    NoVolume,
    #[error("payload is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("failed to encode output: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct InitReport {
    path: String,
    volume: u16,
    page_size: u32,
    pages_per_extent: u32,
}

#[derive(Serialize)]
struct FileReport {
    file: String,
    serial: u32,
    first_page: u32,
}

#[derive(Serialize)]
struct PutReport {
    oid: String,
    len: usize,
}

#[derive(Serialize)]
struct ObjectReport {
    oid: String,
    properties: u16,
    tag: u16,
    length: u32,
    data: String,
}

#[derive(Serialize)]
struct DelReport {
    oid: String,
    released_pages: usize,
}

#[derive(Serialize)]
struct FilesReport {
    files: Vec<String>,
}

#[derive(Serialize)]
struct ObjectsReport {
    file: String,
    pages: Vec<u32>,
    tiers: Vec<TierReport>,
    objects: Vec<String>,
}

#[derive(Serialize)]
struct TierReport {
    percent: usize,
    pages: Vec<u32>,
}

#[derive(Serialize)]
struct VolumeReport {
    volume: u16,
    page_size: usize,
    extents: usize,
    pages: u32,
    files: usize,
    cache_hits: u64,
    cache_misses: u64,
}

fn main() {
    let cli = Cli::parse();
    let ui = Ui::new(cli.theme);
    if let Err(err) = init_logging(&cli.log_level) {
        ui.error(&err.to_string());
        std::process::exit(2);
    }
    if let Err(err) = run(cli, &ui) {
        ui.error(&err.to_string());
        std::process::exit(1);
    }
}

fn run(cli: Cli, ui: &Ui) -> Result<(), CliError> {
    let config = CliConfig::load(cli.config.clone())?;
    debug!(config = ?config.path(), "cli.config.loaded");
    let options = config.store_options()?;
    let path = cli
        .volume
        .clone()
        .or_else(|| config.default_volume().cloned())
        .ok_or(CliError::NoVolume)?;

    match cli.command {
        Command::Init(cmd) => {
            let report = init(&path, options, &cmd)?;
            emit(cli.format, &report, || {
                ui.success(&format!("initialized {}", report.path));
                ui.section(
                    "Volume",
                    [
                        ("volume", report.volume.to_string()),
                        ("page_size", report.page_size.to_string()),
                        ("pages_per_extent", report.pages_per_extent.to_string()),
                    ],
                );
            })?;
        }
        Command::CreateFile { fill_factor } => {
            let volume = Volume::open(&path, options)?;
            let fill = fill_factor.unwrap_or(volume.options().fill_factor);
            let file = volume
                .objects()
                .create_file(volume.options().volume(), fill)?;
            let first_page = volume.objects().catalog().read_entry(file)?.first_page;
            volume.flush()?;
            let report = FileReport {
                file: file.to_string(),
                serial: file.serial,
                first_page: first_page.0,
            };
            emit(cli.format, &report, || println!("{}", report.serial))?;
        }
        Command::Put(cmd) => {
            let volume = Volume::open(&path, options)?;
            let data = if cmd.hex {
                hex::decode(cmd.data.trim())?
            } else {
                cmd.data.into_bytes()
            };
            let file = FileId::new(volume.options().volume(), cmd.file);
            let oid = volume.objects().create_object(
                file,
                cmd.near,
                &ObjectHeader::new(0, cmd.tag),
                &data,
            )?;
            volume.flush()?;
            let report = PutReport {
                oid: oid.to_string(),
                len: data.len(),
            };
            emit(cli.format, &report, || println!("{}", report.oid))?;
        }
        Command::Get { oid, hex } => {
            let volume = Volume::open(&path, options)?;
            let object = volume.objects().read_object(oid)?;
            let data = if hex {
                hex::encode(&object.data)
            } else {
                String::from_utf8_lossy(&object.data).into_owned()
            };
            let report = ObjectReport {
                oid: oid.to_string(),
                properties: object.header.properties,
                tag: object.header.tag,
                length: object.header.length,
                data,
            };
            emit(cli.format, &report, || println!("{}", report.data))?;
        }
        Command::Del { file, oid } => {
            let volume = Volume::open(&path, options)?;
            let file = FileId::new(volume.options().volume(), file);
            let mut pool = volume.dealloc_pool();
            let mut list = DeallocList::new();
            volume
                .objects()
                .destroy_object(file, oid, &mut pool, &mut list)?;
            let released_pages = volume.release_deallocated(&mut list, &mut pool)?;
            volume.flush()?;
            let report = DelReport {
                oid: oid.to_string(),
                released_pages,
            };
            emit(cli.format, &report, || {
                ui.success(&format!(
                    "destroyed {} ({} page(s) released)",
                    report.oid, report.released_pages
                ))
            })?;
        }
        Command::Ls { file: None } => {
            let volume = Volume::open(&path, options)?;
            let report = FilesReport {
                files: volume.files()?.iter().map(|f| f.to_string()).collect(),
            };
            emit(cli.format, &report, || {
                ui.list("Files", report.files.iter().cloned())
            })?;
        }
        Command::Ls { file: Some(serial) } => {
            let volume = Volume::open(&path, options)?;
            let file = FileId::new(volume.options().volume(), serial);
            let report = ObjectsReport {
                file: file.to_string(),
                pages: volume
                    .objects()
                    .file_pages(file)?
                    .into_iter()
                    .map(|p| p.0)
                    .collect(),
                tiers: volume
                    .objects()
                    .tier_pages(file)?
                    .into_iter()
                    .map(|(tier, pages)| TierReport {
                        percent: tier.percent(),
                        pages: pages.into_iter().map(|p| p.0).collect(),
                    })
                    .collect(),
                objects: volume
                    .objects()
                    .object_ids(file)?
                    .iter()
                    .map(|oid| oid.to_string())
                    .collect(),
            };
            emit(cli.format, &report, || {
                ui.section(
                    "File",
                    [
                        ("file", report.file.clone()),
                        ("pages", format!("{:?}", report.pages)),
                    ],
                );
                ui.section(
                    "Free-space tiers",
                    report
                        .tiers
                        .iter()
                        .filter(|t| !t.pages.is_empty())
                        .map(|t| (tier_label(t.percent), format!("{:?}", t.pages))),
                );
                ui.list("Objects", report.objects.iter().cloned());
            })?;
        }
        Command::Inspect { page: None } => {
            let volume = Volume::open(&path, options)?;
            let map = volume.extent_map();
            let stats = volume.cache_stats();
            let report = VolumeReport {
                volume: volume.options().volume_id,
                page_size: volume.page_size(),
                extents: map.len(),
                pages: map.page_count(),
                files: volume.files()?.len(),
                cache_hits: stats.hits,
                cache_misses: stats.misses,
            };
            emit(cli.format, &report, || {
                ui.section(
                    "Volume",
                    [
                        ("volume", report.volume.to_string()),
                        ("page_size", report.page_size.to_string()),
                        ("extents", report.extents.to_string()),
                        ("pages", report.pages.to_string()),
                        ("files", report.files.to_string()),
                    ],
                )
            })?;
        }
        Command::Inspect { page: Some(page) } => {
            let volume = Volume::open(&path, options)?;
            let id = PageId::new(volume.options().volume(), PageNo(page));
            let summary = volume.objects().page_summary(id)?;
            emit(cli.format, &summary, || print_page_text(ui, &summary))?;
        }
    }
    Ok(())
}

fn init(path: &Path, options: StoreOptions, cmd: &InitCmd) -> Result<InitReport, CliError> {
    let mut options = options;
    if let Some(page_size) = cmd.page_size {
        options.page_size = page_size;
    }
    if let Some(pages) = cmd.pages_per_extent {
        options.pages_per_extent = pages;
    }
    if let Some(id) = cmd.volume_id {
        options.volume_id = id;
    }
    let volume = Volume::create(path, options)?;
    Ok(InitReport {
        path: path.display().to_string(),
        volume: volume.options().volume_id,
        page_size: volume.options().page_size,
        pages_per_extent: volume.options().pages_per_extent,
    })
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), CliError>
where
    T: Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn tier_label(percent: usize) -> &'static str {
    match percent {
        10 => ">=10%",
        20 => ">=20%",
        30 => ">=30%",
        40 => ">=40%",
        _ => ">=50%",
    }
}

fn print_page_text(ui: &Ui, summary: &PageSummary) {
    let link = |p: Option<u32>| p.map_or_else(|| "-".to_string(), |p| p.to_string());
    ui.section(
        "Page",
        [
            ("page", summary.page_no.to_string()),
            ("file", summary.file_serial.to_string()),
            ("slots", summary.n_slots.to_string()),
            ("live", summary.live_objects.to_string()),
            ("free", summary.free.to_string()),
            ("unused", summary.unused.to_string()),
            ("contiguous", summary.contiguous_free.to_string()),
            ("tier", summary.tier.to_string()),
            ("prev", link(summary.prev_page)),
            ("next", link(summary.next_page)),
        ],
    );
}
