//! Stand-in for the Java SCIFIO worker.
//!
//! Speaks the bridge protocol on stdin/stdout. Images are synthesized from
//! their file name, e.g. `scan&sizeX=4&sizeY=3&sizeZ=2&order=ZXY.fake`:
//!
//! - `sizeX`..`sizeC`, `spacingX`..`spacingC`, `order`: geometry
//! - `series`: series count; series `k` is `k` pixels wider along X
//! - `type`: worker type code, `rgb`: components, `endian`: little/big
//! - `fail=<verb>`, `die=<verb>`, `hang=<verb>`: misbehave on that verb
//! - `desync=1`: announce a wrong payload length on `read`
//!
//! Component `k` of pixel `(x, y, z, t, c)` holds
//! `x + 10y + 100z + 1000t + 10000c + k`, cast to the pixel type.
//!
//! Files ending in `.fraw` are written by `create`/`write`/`close` as one
//! header line followed by raw worker-order pixels, and can be read back.
//!
//! `SCIFIO_FAKE_MODE=silent` never completes the handshake,
//! `SCIFIO_FAKE_MODE=crash` exits before it.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use scifio_bridge::ByteOrder;
use scifio_bridge::logging::init_tracing;
use scifio_bridge::protocol::{decode_token, encode_token};

const FAKE_VERSION: &str = "0.0.0-fake";
const MARKER: &str = "ERROR:";
const RAW_HEADER: &str = "fraw";

#[derive(Debug, Clone)]
struct Axis {
    name: char,
    size: u64,
    spacing: f64,
}

#[derive(Debug, Clone)]
struct Geometry {
    /// Worker order, fastest first.
    axes: Vec<Axis>,
    series_count: usize,
    type_code: u8,
    components: usize,
    byte_order: ByteOrder,
}

impl Geometry {
    fn component_size(&self) -> usize {
        match self.type_code {
            0 | 1 => 1,
            2 | 3 | 6 => 4,
            _ => 8,
        }
    }

    fn pixel_bytes(&self) -> usize {
        self.component_size() * self.components
    }

    fn pixel_count(&self) -> u64 {
        self.axes.iter().map(|a| a.size).product()
    }

    fn order(&self) -> String {
        self.axes.iter().map(|a| a.name).collect()
    }

    fn describe_lines(&self, name: &str) -> Vec<String> {
        let mut lines = vec![format!("order {}", self.order())];
        lines.extend(
            self.axes
                .iter()
                .map(|a| format!("{} {} {}", a.name, a.size, a.spacing)),
        );
        lines.push(format!(
            "{} {} {}",
            self.series_count, self.type_code, self.components
        ));
        lines.push(format!("endian {}", self.byte_order.as_str()));
        lines.push(format!("meta {} {}", encode_token("Image Name"), name));
        lines
    }

    /// Parse `origin extent` pairs, one per axis, and check the bounds.
    fn region(&self, args: &[&str]) -> Result<Vec<(u64, u64)>> {
        ensure!(
            args.len() == 2 * self.axes.len(),
            "expected {} region tokens, got {}",
            2 * self.axes.len(),
            args.len()
        );
        let mut region = Vec::with_capacity(self.axes.len());
        for (axis, pair) in self.axes.iter().zip(args.chunks_exact(2)) {
            let origin: u64 = pair[0].parse().context("bad origin")?;
            let extent: u64 = pair[1].parse().context("bad extent")?;
            ensure!(
                extent > 0 && origin + extent <= axis.size,
                "region {origin}+{extent} outside axis {} of size {}",
                axis.name,
                axis.size
            );
            region.push((origin, extent));
        }
        Ok(region)
    }

    /// Byte offset of a worker-order coordinate in a full image buffer.
    fn offset(&self, coord: &[u64]) -> usize {
        let mut stride = 1u64;
        let mut index = 0u64;
        for (axis, c) in self.axes.iter().zip(coord) {
            index += c * stride;
            stride *= axis.size;
        }
        index as usize * self.pixel_bytes()
    }

    fn encode_component(&self, value: u64, out: &mut Vec<u8>) {
        let big = self.byte_order == ByteOrder::Big;
        macro_rules! push {
            ($v:expr) => {
                if big {
                    out.extend_from_slice(&$v.to_be_bytes())
                } else {
                    out.extend_from_slice(&$v.to_le_bytes())
                }
            };
        }
        match self.type_code {
            0 => push!(value as i8),
            1 => push!(value as u8),
            2 => push!(value as i32),
            3 => push!(value as u32),
            4 => push!(value as i64),
            5 => push!(value),
            6 => push!(value as f32),
            _ => push!(value as f64),
        }
    }
}

/// Visit every coordinate of `region` with the first axis varying fastest.
fn for_each_coord(region: &[(u64, u64)], mut visit: impl FnMut(&[u64])) {
    let mut coord: Vec<u64> = region.iter().map(|(o, _)| *o).collect();
    let volume: u64 = region.iter().map(|(_, e)| *e).product();
    for _ in 0..volume {
        visit(&coord);
        for (d, (origin, extent)) in region.iter().enumerate() {
            coord[d] += 1;
            if coord[d] < origin + extent {
                break;
            }
            coord[d] = *origin;
        }
    }
}

#[derive(Debug, Default)]
struct Hooks {
    fail: Option<String>,
    die: Option<String>,
    hang: Option<String>,
    desync: bool,
}

impl Hooks {
    fn apply(&self, verb: &str) -> Result<()> {
        if self.die.as_deref() == Some(verb) {
            tracing::warn!(verb, "Exiting on request");
            std::process::exit(3);
        }
        if self.hang.as_deref() == Some(verb) {
            tracing::warn!(verb, "Hanging on request");
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        }
        if self.fail.as_deref() == Some(verb) {
            bail!("io.scif.FormatException: injected failure in {verb}");
        }
        Ok(())
    }
}

enum Pixels {
    Synthetic,
    Stored(Vec<u8>),
}

struct OpenImage {
    name: String,
    params: BTreeMap<String, String>,
    geometry: Geometry,
    pixels: Pixels,
    hooks: Hooks,
}

struct PendingWrite {
    path: PathBuf,
    geometry: Geometry,
    buffer: Vec<u8>,
}

#[derive(Default)]
struct Worker {
    reading: Option<OpenImage>,
    writing: Option<PendingWrite>,
}

impl Worker {
    fn handle(&mut self, line: &str, input: &mut impl BufRead) -> Result<Vec<u8>> {
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().unwrap_or_default();
        let args: Vec<&str> = tokens.collect();

        match verb {
            "can_read" => {
                let path = path_arg(&args)?;
                let readable = has_extension(&path, "fake") || has_extension(&path, "fraw");
                Ok(reply(&[readable.to_string()]))
            }
            "can_write" => {
                let path = path_arg(&args)?;
                Ok(reply(&[has_extension(&path, "fraw").to_string()]))
            }
            "describe" => self.describe(&path_arg(&args)?),
            "series" => {
                let index = args
                    .first()
                    .ok_or_else(|| anyhow!("series needs an index"))?
                    .parse()
                    .context("bad series index")?;
                self.select_series(index)
            }
            "read" => self.read(&args),
            "create" => self.create(&args),
            "write" => self.write(&args, input),
            "close" => self.close(),
            other => bail!("unknown command '{other}'"),
        }
    }

    fn describe(&mut self, path: &Path) -> Result<Vec<u8>> {
        let image = if has_extension(path, "fraw") {
            open_raw(path)?
        } else {
            open_synthetic(path)?
        };
        image.hooks.apply("describe")?;
        let lines = image.geometry.describe_lines(&image.name);
        tracing::info!(name = %image.name, order = %image.geometry.order(), "Opened image");
        self.reading = Some(image);
        Ok(reply(&lines))
    }

    fn select_series(&mut self, index: usize) -> Result<Vec<u8>> {
        let image = self.reading.as_mut().ok_or_else(|| anyhow!("no image open"))?;
        image.hooks.apply("series")?;
        ensure!(
            index < image.geometry.series_count,
            "series {index} out of range"
        );
        if matches!(image.pixels, Pixels::Synthetic) {
            image.geometry = synthetic_geometry(&image.params, index)?;
        }
        Ok(reply(&image.geometry.describe_lines(&image.name)))
    }

    fn read(&mut self, args: &[&str]) -> Result<Vec<u8>> {
        let image = self.reading.as_ref().ok_or_else(|| anyhow!("no image open"))?;
        image.hooks.apply("read")?;
        let geometry = &image.geometry;
        let region = geometry.region(args)?;

        let pixel_bytes = geometry.pixel_bytes();
        let mut payload = Vec::new();
        for_each_coord(&region, |coord| match &image.pixels {
            Pixels::Synthetic => {
                let base = synthetic_value(geometry, coord);
                for k in 0..geometry.components as u64 {
                    geometry.encode_component(base + k, &mut payload);
                }
            }
            Pixels::Stored(buffer) => {
                let offset = geometry.offset(coord);
                payload.extend_from_slice(&buffer[offset..offset + pixel_bytes]);
            }
        });

        let announced = if image.hooks.desync {
            payload.len() + 1
        } else {
            payload.len()
        };
        let mut out = format!("bytes {announced}\n").into_bytes();
        out.extend_from_slice(&payload);
        out.extend_from_slice(b"done\n");
        Ok(out)
    }

    fn create(&mut self, args: &[&str]) -> Result<Vec<u8>> {
        let [path, order, code, components, endian, sizes @ ..] = args else {
            bail!("create needs path, order, type, components, endian and sizes");
        };
        let path = PathBuf::from(decode_token(path)?);
        ensure!(has_extension(&path, "fraw"), "cannot write {}", path.display());
        let geometry = raw_geometry(order, code, components, endian, sizes)?;
        let buffer = vec![0u8; geometry.pixel_count() as usize * geometry.pixel_bytes()];

        tracing::info!(path = %path.display(), order, "Created image");
        self.reading = None;
        self.writing = Some(PendingWrite {
            path,
            geometry,
            buffer,
        });
        Ok(reply(&[]))
    }

    fn write(&mut self, args: &[&str], input: &mut impl BufRead) -> Result<Vec<u8>> {
        // Consume the payload even on failure so the stream stays aligned.
        let mut header = String::new();
        input.read_line(&mut header)?;
        let len: usize = header
            .trim_end()
            .strip_prefix("bytes ")
            .ok_or_else(|| anyhow!("expected length line, got '{}'", header.trim_end()))?
            .parse()
            .context("bad payload length")?;
        let mut payload = vec![0u8; len];
        input.read_exact(&mut payload)?;

        let pending = self.writing.as_mut().ok_or_else(|| anyhow!("no image created"))?;
        let geometry = &pending.geometry;
        let region = geometry.region(args)?;
        let pixel_bytes = geometry.pixel_bytes();
        let volume: u64 = region.iter().map(|(_, e)| *e).product();
        ensure!(
            payload.len() == volume as usize * pixel_bytes,
            "payload of {} bytes does not match region",
            payload.len()
        );

        let buffer = &mut pending.buffer;
        let mut chunks = payload.chunks_exact(pixel_bytes);
        for_each_coord(&region, |coord| {
            if let Some(pixel) = chunks.next() {
                let offset = geometry.offset(coord);
                buffer[offset..offset + pixel_bytes].copy_from_slice(pixel);
            }
        });
        Ok(reply(&[]))
    }

    fn close(&mut self) -> Result<Vec<u8>> {
        self.reading = None;
        if let Some(pending) = self.writing.take() {
            let g = &pending.geometry;
            let sizes: Vec<String> = g
                .axes
                .iter()
                .map(|a| format!("{}:{}", a.size, a.spacing))
                .collect();
            let mut file = format!(
                "{RAW_HEADER} {} {} {} {} {}\n",
                g.order(),
                g.type_code,
                g.components,
                g.byte_order.as_str(),
                sizes.join(" ")
            )
            .into_bytes();
            file.extend_from_slice(&pending.buffer);
            std::fs::write(&pending.path, file)
                .with_context(|| format!("writing {}", pending.path.display()))?;
            tracing::info!(path = %pending.path.display(), "Flushed image");
        }
        Ok(reply(&[]))
    }
}

fn reply(lines: &[String]) -> Vec<u8> {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("done\n");
    out.into_bytes()
}

fn path_arg(args: &[&str]) -> Result<PathBuf> {
    match args {
        [token] => Ok(PathBuf::from(decode_token(token)?)),
        _ => bail!("expected one path argument"),
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e == ext)
}

fn synthetic_value(geometry: &Geometry, coord: &[u64]) -> u64 {
    geometry
        .axes
        .iter()
        .zip(coord)
        .map(|(axis, c)| {
            let weight = match axis.name {
                'X' => 1,
                'Y' => 10,
                'Z' => 100,
                'T' => 1000,
                'C' => 10000,
                _ => 0,
            };
            c * weight
        })
        .sum()
}

fn open_synthetic(path: &Path) -> Result<OpenImage> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("bad file name {}", path.display()))?;
    let stem = file_name
        .strip_suffix(".fake")
        .ok_or_else(|| anyhow!("io.scif.FormatException: unsupported format {file_name}"))?;

    let mut parts = stem.split('&');
    let name = parts.next().unwrap_or_default().to_string();
    let mut params = BTreeMap::new();
    for part in parts {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| anyhow!("bad parameter '{part}'"))?;
        params.insert(key.to_string(), value.to_string());
    }

    let hooks = Hooks {
        fail: params.get("fail").cloned(),
        die: params.get("die").cloned(),
        hang: params.get("hang").cloned(),
        desync: params.get("desync").is_some_and(|v| v == "1"),
    };
    let geometry = synthetic_geometry(&params, 0)?;
    Ok(OpenImage {
        name,
        params,
        geometry,
        pixels: Pixels::Synthetic,
        hooks,
    })
}

fn synthetic_geometry(params: &BTreeMap<String, String>, series: usize) -> Result<Geometry> {
    let order = match params.get("order") {
        Some(order) => order.clone(),
        None => "XYZTC"
            .chars()
            .filter(|c| matches!(c, 'X' | 'Y') || params.contains_key(&format!("size{c}")))
            .collect(),
    };

    let mut axes = Vec::with_capacity(order.len());
    for name in order.chars() {
        let default_size = match name {
            'X' => 4,
            'Y' => 3,
            _ => 1,
        };
        let mut size = param(params, &format!("size{name}"), default_size)?;
        if name == 'X' {
            size += series as u64;
        }
        let spacing = param(params, &format!("spacing{name}"), 1.0)?;
        axes.push(Axis {
            name,
            size,
            spacing,
        });
    }

    Ok(Geometry {
        axes,
        series_count: param(params, "series", 1)?,
        type_code: param(params, "type", 1)?,
        components: param(params, "rgb", 1)?,
        byte_order: match params.get("endian").map(String::as_str) {
            Some("big") => ByteOrder::Big,
            _ => ByteOrder::Little,
        },
    })
}

fn param<T>(params: &BTreeMap<String, String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match params.get(key) {
        Some(value) => value.parse().with_context(|| format!("bad {key}={value}")),
        None => Ok(default),
    }
}

fn raw_geometry(
    order: &str,
    code: &str,
    components: &str,
    endian: &str,
    sizes: &[&str],
) -> Result<Geometry> {
    ensure!(
        order.chars().count() == sizes.len(),
        "order {order} does not match {} sizes",
        sizes.len()
    );
    let mut axes = Vec::with_capacity(sizes.len());
    for (name, token) in order.chars().zip(sizes) {
        let (size, spacing) = token
            .split_once(':')
            .ok_or_else(|| anyhow!("bad size token '{token}'"))?;
        axes.push(Axis {
            name,
            size: size.parse().context("bad size")?,
            spacing: spacing.parse().context("bad spacing")?,
        });
    }
    Ok(Geometry {
        axes,
        series_count: 1,
        type_code: code.parse().context("bad type code")?,
        components: components.parse().context("bad component count")?,
        byte_order: ByteOrder::parse(endian).ok_or_else(|| anyhow!("bad byte order {endian}"))?,
    })
}

fn open_raw(path: &Path) -> Result<OpenImage> {
    let contents = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let newline = contents
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| anyhow!("missing header in {}", path.display()))?;
    let header = std::str::from_utf8(&contents[..newline])?;
    let tokens: Vec<&str> = header.split_whitespace().collect();
    let [RAW_HEADER, order, code, components, endian, sizes @ ..] = tokens.as_slice() else {
        bail!("bad header in {}", path.display());
    };
    let geometry = raw_geometry(order, code, components, endian, sizes)?;
    let pixels = contents[newline + 1..].to_vec();
    ensure!(
        pixels.len() == geometry.pixel_count() as usize * geometry.pixel_bytes(),
        "truncated pixel data in {}",
        path.display()
    );

    Ok(OpenImage {
        name: path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        params: BTreeMap::new(),
        geometry,
        pixels: Pixels::Stored(pixels),
        hooks: Hooks::default(),
    })
}

fn main() -> Result<()> {
    init_tracing();

    match std::env::var("SCIFIO_FAKE_MODE").as_deref() {
        Ok("silent") => {
            tracing::info!("Staying silent");
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        }
        Ok("crash") => {
            writeln!(
                io::stderr(),
                "Error: Could not find or load main class io.scif.itk.SCIFIOITKBridge"
            )?;
            std::process::exit(2);
        }
        _ => {}
    }

    let mut out = io::stdout().lock();
    writeln!(out, "Fake SCIFIO worker {FAKE_VERSION} starting")?;
    writeln!(out, "ready {FAKE_VERSION}")?;
    out.flush()?;

    let mut input = io::stdin().lock();
    let mut worker = Worker::default();
    let mut line = Vec::new();
    loop {
        line.clear();
        if input.read_until(b'\n', &mut line)? == 0 {
            tracing::info!("Host closed stdin, exiting");
            return Ok(());
        }
        let command = String::from_utf8_lossy(&line).trim_end().to_string();
        tracing::debug!(command = %command, "Received command");

        match worker.handle(&command, &mut input) {
            Ok(response) => out.write_all(&response)?,
            Err(e) => writeln!(out, "{MARKER} {e}")?,
        }
        out.flush()?;
    }
}
