use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use facegate_core::{identify, CommandProvider, EmbeddingProvider, Gallery};
use facegate_hw::camera::Camera;
use facegate_hw::{PresenceSensor, SensorTransport};
use serde::Serialize;
use std::path::{Path, PathBuf};

mod annotate;

use annotate::Annotation;

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate access-control CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the gallery from <root>/<label>/<image> and save it
    Enroll {
        /// Directory holding one subdirectory per label
        #[arg(short, long)]
        root: PathBuf,
        #[command(flatten)]
        gallery: GalleryArgs,
        #[command(flatten)]
        embed: EmbedArgs,
    },
    /// Identify every face in an image
    Identify {
        image: PathBuf,
        /// Write a copy of the image with each face boxed and labeled
        #[arg(long, value_name = "OUT")]
        annotate: Option<PathBuf>,
        /// TrueType font for the labels (defaults to a system font)
        #[arg(long, env = "FACEGATE_FONT")]
        font: Option<PathBuf>,
        #[command(flatten)]
        gallery: GalleryArgs,
        #[command(flatten)]
        embed: EmbedArgs,
    },
    /// Measure accuracy over a labeled directory tree
    Validate {
        /// Directory holding one subdirectory per expected label
        #[arg(short, long)]
        root: PathBuf,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        gallery: GalleryArgs,
        #[command(flatten)]
        embed: EmbedArgs,
    },
    /// List enrolled labels
    List {
        #[command(flatten)]
        gallery: GalleryArgs,
    },
    /// List V4L2 capture devices
    Devices,
    /// Handshake with the presence sensor and poll once
    Sensor {
        /// Serial port (selects UART transport)
        #[arg(long, conflicts_with_all = ["bus", "address"])]
        serial: Option<String>,
        #[arg(long, default_value_t = 9600)]
        baud: u32,
        /// I2C bus device
        #[arg(long, default_value = "/dev/i2c-1")]
        bus: String,
        /// I2C address, decimal or 0x-prefixed hex
        #[arg(long, default_value = "0x32", value_parser = parse_address)]
        address: u16,
    },
}

#[derive(Args)]
struct GalleryArgs {
    /// Gallery artifact path
    #[arg(long, env = "FACEGATE_GALLERY")]
    gallery: Option<PathBuf>,
    /// Maximum distance for an enrolled face to count as a match
    #[arg(long, env = "FACEGATE_THRESHOLD", default_value_t = 0.6)]
    threshold: f32,
}

impl GalleryArgs {
    fn path(&self) -> PathBuf {
        self.gallery.clone().unwrap_or_else(default_gallery_path)
    }

    fn load(&self) -> Result<Gallery> {
        let path = self.path();
        Gallery::load(&path)
            .with_context(|| format!("loading {} (run `facegate enroll` first)", path.display()))
    }
}

#[derive(Args)]
struct EmbedArgs {
    /// Embedding helper program
    #[arg(long, env = "FACEGATE_EMBED_COMMAND", default_value = "facegate-embed")]
    embed_command: String,
    /// Extra argument for the helper (repeatable)
    #[arg(long = "embed-arg", allow_hyphen_values = true)]
    embed_args: Vec<String>,
}

impl EmbedArgs {
    fn provider(&self) -> CommandProvider {
        CommandProvider::new(self.embed_command.clone(), self.embed_args.clone())
    }
}

fn default_gallery_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate/gallery.json")
}

fn parse_address(raw: &str) -> Result<u16, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| format!("invalid I2C address {raw:?}: {e}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { root, gallery, embed } => {
            let built = Gallery::build(&root, &mut embed.provider())?;
            if built.is_empty() {
                bail!("no faces found under {}", root.display());
            }
            built.save(&gallery.path())?;
            println!(
                "Enrolled {} face(s) across {} label(s) into {}",
                built.len(),
                built.label_counts().len(),
                gallery.path().display()
            );
        }
        Commands::Identify {
            image: probe,
            annotate,
            font,
            gallery,
            embed,
        } => {
            let loaded = gallery.load()?;
            let faces = embed.provider().embed(&probe)?;
            if faces.is_empty() {
                println!("No faces detected");
            }
            let mut annotations = Vec::with_capacity(faces.len());
            for face in faces {
                let result = identify(&face.embedding, &loaded, gallery.threshold);
                let b = face.bounding_box;
                println!(
                    "{} (votes: {}) at top={} right={} bottom={} left={}",
                    result.display_label(),
                    result.confidence_votes,
                    b.top,
                    b.right,
                    b.bottom,
                    b.left
                );
                annotations.push(Annotation {
                    bounding_box: b,
                    label: result.display_label().to_string(),
                });
            }

            if let Some(out) = annotate {
                let font = annotate::load_font(font.as_deref())?;
                if font.is_none() {
                    tracing::warn!("no font found; drawing boxes without labels (set --font)");
                }
                let mut canvas = image::open(&probe)
                    .with_context(|| format!("reading {}", probe.display()))?
                    .to_rgb8();
                annotate::annotate(&mut canvas, &annotations, font.as_ref());
                canvas
                    .save(&out)
                    .with_context(|| format!("writing {}", out.display()))?;
                println!("Annotated image written to {}", out.display());
            }
        }
        Commands::Validate { root, json, gallery, embed } => {
            let loaded = gallery.load()?;
            let report = validate(&root, &loaded, gallery.threshold, &mut embed.provider())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for case in &report.cases {
                    let mark = if case.correct { "ok  " } else { "MISS" };
                    println!("{mark} {} expected={} got={}", case.image, case.expected, case.predicted.join(","));
                }
                println!(
                    "{}/{} correct ({:.1}%)",
                    report.correct,
                    report.total,
                    report.accuracy() * 100.0
                );
            }
        }
        Commands::List { gallery } => {
            let loaded = gallery.load()?;
            for (label, count) in loaded.label_counts() {
                println!("{label}\t{count}");
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}\t{} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Sensor { serial, baud, bus, address } => {
            let transport = match serial {
                Some(port) => SensorTransport::Serial { port, baud },
                None => SensorTransport::I2c { bus, address },
            };
            let mut sensor = transport.open()?;
            if !sensor.handshake() {
                bail!("sensor did not answer the handshake");
            }
            println!("Handshake ok");
            let events = sensor.poll()?;
            if events.is_empty() {
                println!("No presence");
            }
            for e in events {
                println!("object {} trained={}", e.object_id, e.trained);
            }
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct ValidationCase {
    image: String,
    expected: String,
    predicted: Vec<String>,
    correct: bool,
}

#[derive(Serialize)]
struct ValidationReport {
    total: usize,
    correct: usize,
    cases: Vec<ValidationCase>,
}

impl ValidationReport {
    fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f64 / self.total as f64
    }
}

/// Identify every image under `<root>/<label>/`; an image counts as correct
/// when any face in it is identified as its directory's label.
fn validate<P: EmbeddingProvider>(
    root: &Path,
    gallery: &Gallery,
    threshold: f32,
    provider: &mut P,
) -> Result<ValidationReport> {
    let mut cases = Vec::new();
    for label_dir in sorted_dir(root)? {
        if !label_dir.is_dir() {
            continue;
        }
        let expected = label_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        for path in sorted_dir(&label_dir)? {
            if !path.is_file() || image::ImageFormat::from_path(&path).is_err() {
                continue;
            }
            let faces = match provider.embed(&path) {
                Ok(faces) => faces,
                Err(e) => {
                    tracing::warn!(image = %path.display(), error = %e, "skipping image");
                    continue;
                }
            };
            let predicted: Vec<String> = faces
                .iter()
                .map(|f| identify(&f.embedding, gallery, threshold).display_label().to_string())
                .collect();
            let correct = predicted.iter().any(|p| *p == expected);
            cases.push(ValidationCase {
                image: path.display().to_string(),
                expected: expected.clone(),
                predicted,
                correct,
            });
        }
    }

    Ok(ValidationReport {
        total: cases.len(),
        correct: cases.iter().filter(|c| c.correct).count(),
        cases,
    })
}

fn sorted_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}
