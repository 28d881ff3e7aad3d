use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use ffladder::config::{self, Config};
use ffladder::engine::{
    self, Channel, EncodeSpecRegistry, Downstream, OutputMode, OutputSinks, StageInput,
    StageReport, StreamFormat, TranscodeStage,
};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;

pub fn run(cli: Cli) {
    match cli.command {
        Commands::Transcode {
            config,
            input,
            output_dir,
            mode,
            json,
        } => handle_transcode(config, input, output_dir, mode, json),
        Commands::DryRun { config, mode } => handle_dry_run(config, mode),
        Commands::CheckFfmpeg { config } => handle_check_ffmpeg(config),
        Commands::InitConfig => handle_init_config(),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

/// Stage with every configured output registered, in config order
fn build_stage(cfg: &Config, mode: Option<OutputMode>) -> Result<TranscodeStage> {
    let mut stage = TranscodeStage::new(cfg.encoder.stage_settings(mode));
    for entry in &cfg.outputs {
        stage
            .register(entry.id, entry.options.clone())
            .with_context(|| format!("Invalid output {}", entry.id))?;
    }
    Ok(stage)
}

/// Writes every output channel to its own file under one directory
struct FileDownstream {
    dir: PathBuf,
    names: HashMap<Channel, String>,
    files: HashMap<Channel, BufWriter<File>>,
}

impl FileDownstream {
    fn new(dir: PathBuf, stage: &TranscodeStage) -> Self {
        let names = stage
            .specs()
            .iter()
            .map(|spec| {
                (
                    Channel::Output(spec.id),
                    format!("{}.{}", spec.id, spec.options.muxer()),
                )
            })
            .chain(std::iter::once((Channel::Combined, "combined.ts".to_string())))
            .collect();

        Self {
            dir,
            names,
            files: HashMap::new(),
        }
    }

    fn path_for(&self, channel: Channel) -> PathBuf {
        let name = self
            .names
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| format!("{}.bin", channel).replace(' ', "-"));
        self.dir.join(name)
    }

    fn writer(&mut self, channel: Channel) -> io::Result<&mut BufWriter<File>> {
        if !self.files.contains_key(&channel) {
            let path = self.path_for(channel);
            tracing::info!(%channel, path = %path.display(), "writing output");
            let file = File::create(&path)?;
            self.files.insert(channel, BufWriter::new(file));
        }
        self.files
            .get_mut(&channel)
            .ok_or_else(|| io::Error::other("output file vanished"))
    }
}

impl Downstream for FileDownstream {
    fn write_chunk(&mut self, channel: Channel, chunk: &[u8]) -> io::Result<()> {
        self.writer(channel)?.write_all(chunk)
    }

    fn end_of_stream(&mut self, channel: Channel) -> io::Result<()> {
        // Channels that produced no bytes still get an (empty) file
        self.writer(channel)?.flush()
    }
}

fn open_input(path: &Path) -> Result<Box<dyn Read + Send>> {
    if path.as_os_str() == "-" {
        Ok(Box::new(io::stdin()))
    } else {
        let file = File::open(path)
            .with_context(|| format!("Failed to open input: {}", path.display()))?;
        Ok(Box::new(file))
    }
}

/// Copy `source` into the stage in `chunk_size` pieces, then signal end of input.
///
/// Returning early without `end_of_input` lets the stage see upstream as closed.
fn feed(
    mut source: Box<dyn Read + Send>,
    input: StageInput,
    chunk_size: usize,
    format: StreamFormat,
) {
    if input.send_format(format).is_err() {
        return;
    }

    let mut buf = vec![0u8; chunk_size];
    loop {
        match source.read(&mut buf) {
            Ok(0) => {
                let _ = input.end_of_input();
                return;
            }
            Ok(n) => {
                if input.send_chunk(&buf[..n]).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!("reading input failed: {}", e);
                return;
            }
        }
    }
}

fn transcode(
    config_path: Option<PathBuf>,
    input_path: PathBuf,
    output_dir: PathBuf,
    mode: Option<OutputMode>,
) -> Result<StageReport> {
    let cfg = load_config(config_path.as_deref())?;
    let mut stage = build_stage(&cfg, mode)?;

    fs::create_dir_all(&output_dir).with_context(|| {
        format!("Failed to create output directory: {}", output_dir.display())
    })?;

    let source = open_input(&input_path)?;
    let input = stage.activate().context("Failed to start the encoder")?;
    if let Some(cmd) = stage.command() {
        tracing::info!("started {}", cmd);
    }

    let chunk_size = stage.settings().read_chunk_size;
    let format = StreamFormat::Elementary {
        codec: cfg
            .encoder
            .input_format
            .clone()
            .unwrap_or_else(|| "h264".to_string()),
    };
    let feeder = thread::Builder::new()
        .name("input-feeder".to_string())
        .spawn(move || feed(source, input, chunk_size, format))
        .context("Failed to spawn input feeder")?;

    let mut downstream = FileDownstream::new(output_dir, &stage);
    let report = stage.run(&mut downstream)?;

    // The feeder already signalled end of input on success
    let _ = feeder.join();
    Ok(report)
}

fn handle_transcode(
    config_path: Option<PathBuf>,
    input: PathBuf,
    output_dir: PathBuf,
    mode: Option<OutputMode>,
    json: bool,
) {
    match transcode(config_path, input, output_dir.clone(), mode) {
        Ok(report) => {
            if json {
                match serde_json::to_string_pretty(&report) {
                    Ok(text) => println!("{}", text),
                    Err(e) => {
                        eprintln!("Error: {:#}", e);
                        process::exit(1);
                    }
                }
            } else {
                println!(
                    "Transcoded {} bytes in {} mode (encoder exit code {})",
                    report.bytes_in, report.mode, report.exit_code
                );
                for channel in &report.channels {
                    println!(
                        "  {}: {} bytes in {} chunks",
                        channel.channel, channel.bytes, channel.chunks
                    );
                }
                println!("Outputs written to {}", output_dir.display());
            }
            process::exit(0);
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn handle_dry_run(config_path: Option<PathBuf>, mode: Option<OutputMode>) {
    let result = load_config(config_path.as_deref()).and_then(|cfg| {
        let settings = cfg.encoder.stage_settings(mode);
        let mut registry = EncodeSpecRegistry::new(settings.mode);
        for entry in &cfg.outputs {
            registry
                .register(entry.id, entry.options.clone())
                .with_context(|| format!("Invalid output {}", entry.id))?;
        }
        registry.seal();

        // Placeholder pipe locations; real runs create a fresh directory
        let fifo_dir = settings
            .fifo_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("ffladder-<run>"));
        let pipes: Vec<PathBuf> = registry
            .ids()
            .map(|id| fifo_dir.join(format!("{}.fifo", id)))
            .collect();
        let sinks = match settings.mode {
            OutputMode::Combined => OutputSinks::Stdout,
            OutputMode::MultiSink => OutputSinks::Pipes(&pipes),
        };

        Ok((
            settings.mode,
            engine::build_encoder_cmd(registry.specs(), &settings.encoder, sinks),
        ))
    });

    match result {
        Ok((mode, cmd)) => {
            println!("Mode: {}", mode);
            println!("{}", cmd);
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn handle_check_ffmpeg(config_path: Option<PathBuf>) {
    let cfg = match load_config(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    };
    let program = &cfg.encoder.ffmpeg_path;

    match engine::ffmpeg_version(program) {
        Ok(version) => println!("ffmpeg found: {}", version),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }

    let encoders = match engine::available_encoders(program) {
        Ok(encoders) => encoders,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    };

    let mut missing = Vec::new();
    for entry in &cfg.outputs {
        let codec = match &entry.options {
            engine::OutputOptions::Video(v) => &v.codec,
            engine::OutputOptions::Audio(a) => &a.codec,
        };
        if encoders.iter().any(|e| e == codec) {
            println!("  output {}: {} available", entry.id, codec);
        } else {
            println!("  output {}: {} NOT available", entry.id, codec);
            missing.push(codec.clone());
        }
    }

    if missing.is_empty() {
        process::exit(0);
    } else {
        eprintln!("Error: missing encoders: {}", missing.join(", "));
        process::exit(1);
    }
}

fn handle_init_config() {
    match config::Config::config_path() {
        Ok(path) if path.exists() => match Config::load_from(&path) {
            Ok(cfg) => {
                println!("Config loaded successfully from {}", path.display());
                println!("{:#?}", cfg);
            }
            Err(e) => {
                eprintln!("Config invalid: {:#}", e);
                process::exit(1);
            }
        },
        Ok(_) => {
            println!("Config missing, creating default config...");
            match Config::default().save() {
                Ok(path) => println!("Default config saved to {}", path.display()),
                Err(e) => {
                    eprintln!("Failed to save default config: {:#}", e);
                    process::exit(1);
                }
            }
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}
