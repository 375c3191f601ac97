use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use rollcall_core::service::AttendanceStatus;
use rollcall_core::{
    AttendanceRecord, AttendanceService, BusKind, Config, FaceOutcome, ImportReport, OnnxExtractor, Outcome,
    Registered,
};
use serde::de::DeserializeOwned;
use std::io::BufRead;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register every person directory of a dataset (runs locally)
    Import {
        /// Dataset root; defaults to the configured dataset directory
        root: Option<PathBuf>,
    },
    /// Check in images one at a time (runs locally). Reads paths from stdin when none are given
    Attend {
        images: Vec<PathBuf>,
    },
    /// Send one image to the daemon and mark attendance for known faces
    CheckIn {
        image: PathBuf,
    },
    /// Register a person with the daemon
    Register {
        #[arg(long)]
        reg_no: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        cohort: String,
        #[arg(long, default_value = "")]
        phone: String,
        /// Replace the fingerprint of an already registered person
        #[arg(long)]
        replace: bool,
        /// Sample images of the person's face
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Show the most recent attendance records
    Recent {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Show daemon status
    Status,
}

// Client side of `org.rollcall.Attendance1`; replies are JSON `Outcome`s.
#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn check_in(&self, image: &[u8]) -> zbus::Result<String>;
    async fn register(
        &self,
        reg_no: &str,
        name: &str,
        cohort: &str,
        phone: &str,
        images: &[Vec<u8>],
    ) -> zbus::Result<String>;
    async fn reregister(
        &self,
        reg_no: &str,
        name: &str,
        cohort: &str,
        phone: &str,
        images: &[Vec<u8>],
    ) -> zbus::Result<String>;
    async fn recent(&self, limit: u32) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Import { root } => {
            let root = root.unwrap_or_else(|| config.dataset_dir.clone());
            let report = tokio::task::spawn_blocking(move || import(&config, &root)).await??;
            print_import(&report);
            if report.registered.is_empty() && !report.failed.is_empty() {
                bail!("no identity was imported");
            }
        }
        Commands::Attend { images } => {
            tokio::task::spawn_blocking(move || attend(&config, images)).await??;
        }
        Commands::CheckIn { image } => {
            let bytes = read_image(&image)?;
            let proxy = connect(&config).await?;
            let faces: Vec<FaceOutcome> = decode(&proxy.check_in(&bytes).await?)?;
            print_faces(&faces);
        }
        Commands::Register {
            reg_no,
            name,
            cohort,
            phone,
            replace,
            images,
        } => {
            let images = images.iter().map(|p| read_image(p)).collect::<Result<Vec<_>>>()?;
            let proxy = connect(&config).await?;
            let reply = if replace {
                proxy.reregister(&reg_no, &name, &cohort, &phone, &images).await?
            } else {
                proxy.register(&reg_no, &name, &cohort, &phone, &images).await?
            };
            let registered: Registered = decode(&reply)?;
            print_registered(&registered);
        }
        Commands::Recent { limit } => {
            let proxy = connect(&config).await?;
            let records: Vec<AttendanceRecord> = decode(&proxy.recent(limit).await?)?;
            print_recent(&records);
        }
        Commands::Status => {
            let proxy = connect(&config).await?;
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

async fn connect(config: &Config) -> Result<AttendanceProxy<'static>> {
    tracing::debug!(bus = ?config.bus, "connecting to rollcalld");
    let conn = match config.bus {
        BusKind::System => zbus::Connection::system().await?,
        BusKind::Session => zbus::Connection::session().await?,
    };
    AttendanceProxy::new(&conn)
        .await
        .context("rollcalld is not reachable on D-Bus")
}

/// Unwrap a JSON `Outcome` from the daemon.
fn decode<T: DeserializeOwned>(json: &str) -> Result<T> {
    let outcome: Outcome<T> = serde_json::from_str(json).context("malformed reply from rollcalld")?;
    Ok(outcome.into_result()?)
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))
}

fn open_local(config: &Config) -> Result<(AttendanceService, OnnxExtractor)> {
    let service = AttendanceService::open(config)
        .with_context(|| format!("cannot open database {}", config.db_path.display()))?;
    let extractor = OnnxExtractor::load(config).context("cannot load face models")?;
    Ok((service, extractor))
}

fn import(config: &Config, root: &Path) -> Result<ImportReport> {
    let (service, mut extractor) = open_local(config)?;
    service
        .import(&mut extractor, root, Local::now().naive_local())
        .with_context(|| format!("cannot read dataset {}", root.display()))
}

/// Single-threaded loop: each image is fully processed before the next.
fn attend(config: &Config, images: Vec<PathBuf>) -> Result<()> {
    let (service, mut extractor) = open_local(config)?;

    let paths: Box<dyn Iterator<Item = PathBuf>> = if images.is_empty() {
        eprintln!("reading image paths from stdin, one per line");
        Box::new(
            std::io::stdin()
                .lock()
                .lines()
                .map_while(|line| line.ok())
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .map(PathBuf::from),
        )
    } else {
        Box::new(images.into_iter())
    };

    for path in paths {
        println!("{}:", path.display());
        let bytes = match read_image(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                println!("  {e:#}");
                continue;
            }
        };
        match service.check_in(&mut extractor, &bytes, Local::now().naive_local()) {
            Ok(faces) => print_faces(&faces),
            Err(e) => println!("  {}: {e}", e.kind()),
        }
    }
    Ok(())
}

fn print_faces(faces: &[FaceOutcome]) {
    if faces.is_empty() {
        println!("  no faces detected");
    }
    for (i, face) in faces.iter().enumerate() {
        let b = &face.bbox;
        let at = format!("[{:.0},{:.0} {:.0}x{:.0}]", b.x, b.y, b.width, b.height);
        match (&face.reg_no, &face.error) {
            (None, Some(failure)) => println!("  face {i} {at}: {failure}"),
            (None, None) => println!("  face {i} {at}: unknown (best score {:.3})", face.score),
            (Some(reg_no), error) => {
                let name = face.name.as_deref().unwrap_or("?");
                let attendance = match (face.attendance, error) {
                    (Some(AttendanceStatus::NewlyMarked), _) => "attendance marked".to_string(),
                    (Some(AttendanceStatus::AlreadyMarked), _) => "already marked today".to_string(),
                    (None, Some(failure)) => format!("not marked: {failure}"),
                    (None, None) => "not marked".to_string(),
                };
                println!("  face {i} {at}: {reg_no} {name} (score {:.3}), {attendance}", face.score);
            }
        }
    }
}

fn print_registered(registered: &Registered) {
    println!(
        "registered {} from {} sample(s)",
        registered.reg_no, registered.samples_used
    );
    for warning in &registered.warnings {
        println!("  sample {} dropped: {}", warning.index, warning.failure);
    }
}

fn print_import(report: &ImportReport) {
    for registered in &report.registered {
        print_registered(registered);
    }
    for failed in &report.failed {
        println!("failed {}: {}", failed.reg_no, failed.failure);
    }
    for skipped in &report.skipped {
        println!("skipped {}: {}", skipped.name, skipped.reason);
    }
    println!(
        "{} registered, {} failed, {} skipped",
        report.registered.len(),
        report.failed.len(),
        report.skipped.len()
    );
}

fn print_recent(records: &[AttendanceRecord]) {
    if records.is_empty() {
        println!("no attendance recorded");
    }
    for record in records {
        println!(
            "{}  {:<12} {}",
            record.marked_at.format("%Y-%m-%d %H:%M:%S"),
            record.reg_no,
            record.name.as_deref().unwrap_or("")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::ErrorKind;

    #[test]
    fn test_decode_success() {
        let records: Vec<AttendanceRecord> = decode(
            r#"{"success":[{"reg_no":"S001","name":"Alice","marked_at":"2024-03-04T09:00:00"}]}"#,
        )
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_decode_failure_carries_kind() {
        let err = decode::<Registered>(
            r#"{"failure":{"kind":"DuplicateIdentity","message":"identity S001 is already registered"}}"#,
        )
        .unwrap_err();
        let failure = err.downcast_ref::<rollcall_core::Failure>().unwrap();
        assert_eq!(failure.kind, ErrorKind::DuplicateIdentity);
    }

    #[test]
    fn test_cli_parses_register() {
        let cli = Cli::try_parse_from([
            "rollcall", "register", "--reg-no", "S001", "--name", "Alice", "a.jpg", "b.jpg",
        ])
        .unwrap();
        match cli.command {
            Commands::Register { reg_no, cohort, replace, images, .. } => {
                assert_eq!(reg_no, "S001");
                assert_eq!(cohort, "");
                assert!(!replace);
                assert_eq!(images.len(), 2);
            }
            _ => panic!("expected register"),
        }
    }

    #[test]
    fn test_cli_register_needs_images() {
        assert!(Cli::try_parse_from(["rollcall", "register", "--reg-no", "S001", "--name", "A"]).is_err());
    }
}
