//! Request/response exchanges with the worker.
//!
//! - **command**: request lines, response classification, error marker
//!
//! One [`CommandProtocol`] owns the channel to one worker and the descriptor
//! of the image currently open on it. Every exchange is strictly sequential:
//! send one request, consume lines until `done` or the error marker.

pub mod command;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::bytes::Bytes;

use crate::channel::LineChannel;
use crate::descriptor::{AxisInfo, AxisName, ImageDescriptor, RegionRequest, parse_order};
use crate::error::{BridgeError, Result};
use crate::pixel::{ByteOrder, swap_byte_order, to_local, to_remote, widen_components};
use crate::region;

pub use command::{CommandLine, ErrorMarker, ResponseLine, decode_token, encode_token};
use command::{BYTES_TOKEN, READY_TOKEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMode {
    Read,
    Write,
}

pub struct CommandProtocol<R, W> {
    channel: LineChannel<R, W>,
    error_marker: ErrorMarker,
    read_timeout: Duration,
    descriptor: Option<ImageDescriptor>,
    mode: Option<OpenMode>,
}

impl<R, W> CommandProtocol<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        channel: LineChannel<R, W>,
        error_marker: ErrorMarker,
        read_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            error_marker,
            read_timeout,
            descriptor: None,
            mode: None,
        }
    }

    /// Wait for the worker's `ready [version]` line and return the version.
    ///
    /// Anything the worker prints before that (JVM banners and the like) is
    /// logged and skipped. EOF surfaces as `ProcessLaunch`.
    pub async fn handshake(&mut self, timeout: Duration) -> Result<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = match self.channel.read_line(remaining).await {
                Ok(line) => line,
                Err(BridgeError::ChannelTimeout(_)) => {
                    return Err(BridgeError::HandshakeTimeout(timeout));
                }
                Err(BridgeError::ChannelClosed(reason)) => {
                    return Err(BridgeError::ProcessLaunch(format!(
                        "worker exited before becoming ready ({reason})"
                    )));
                }
                Err(e) => return Err(e),
            };

            if let Some(message) = self.error_marker.strip(&line) {
                return Err(BridgeError::ProcessLaunch(message.to_string()));
            }

            let mut tokens = line.split_whitespace();
            if tokens.next() == Some(READY_TOKEN) {
                let version = tokens.next().map(str::to_string);
                tracing::debug!(worker_version = ?version, "Worker ready");
                return Ok(version);
            }
            tracing::debug!(line = %line, "Skipping worker output before handshake");
        }
    }

    pub fn error_marker(&self) -> &ErrorMarker {
        &self.error_marker
    }

    /// Descriptor of the image open for reading or writing, if any.
    pub fn descriptor(&self) -> Option<&ImageDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn is_reading(&self) -> bool {
        self.mode == Some(OpenMode::Read)
    }

    pub fn is_writing(&self) -> bool {
        self.mode == Some(OpenMode::Write)
    }

    pub async fn can_read(&mut self, path: &Path) -> Result<bool> {
        self.probe(CommandLine::new("can_read").path(path)).await
    }

    pub async fn can_write(&mut self, path: &Path) -> Result<bool> {
        self.probe(CommandLine::new("can_write").path(path)).await
    }

    async fn probe(&mut self, command: CommandLine) -> Result<bool> {
        self.channel.write_line(&command).await?;
        let answer = match self.next_response().await? {
            ResponseLine::Metadata(line) if line == "true" => true,
            ResponseLine::Metadata(line) if line == "false" => false,
            other => return Err(unexpected(command.verb(), &other)),
        };
        self.expect_ack(command.verb()).await?;
        Ok(answer)
    }

    /// Open `path` for reading and make its first series current.
    pub async fn describe(&mut self, path: &Path) -> Result<&ImageDescriptor> {
        let command = CommandLine::new("describe").path(path);
        self.channel.write_line(&command).await?;
        let block = self.collect_block(command.verb()).await?;
        let descriptor = parse_describe(&block, 0)?;

        tracing::debug!(
            path = %path.display(),
            order = descriptor.dimension_order(),
            series_count = descriptor.series_count(),
            component_type = %descriptor.component_type(),
            "Described image"
        );
        if let Ok(json) = serde_json::to_string(&descriptor) {
            tracing::trace!(target: "scifio::descriptor", descriptor = %json, "Image descriptor");
        }
        self.mode = Some(OpenMode::Read);
        Ok(&*self.descriptor.insert(descriptor))
    }

    /// Switch the open file to another series.
    pub async fn select_series(&mut self, index: usize) -> Result<&ImageDescriptor> {
        let count = self.reading("select a series")?.series_count();
        if index >= count {
            return Err(BridgeError::SeriesOutOfRange { index, count });
        }

        let command = CommandLine::new("series").arg(index);
        self.channel.write_line(&command).await?;
        let block = self.collect_block(command.verb()).await?;
        let descriptor = parse_describe(&block, index)?;

        tracing::debug!(series = index, order = descriptor.dimension_order(), "Selected series");
        Ok(&*self.descriptor.insert(descriptor))
    }

    /// Read a host-order region of the current series.
    ///
    /// Returns native-endian components, host axis order, components
    /// interleaved innermost.
    pub async fn read_region(&mut self, request: &RegionRequest) -> Result<Vec<u8>> {
        let descriptor = self.reading("read a region")?;
        request.validate(descriptor)?;
        let worker_region = region::to_worker_order(descriptor, request)?;
        let expected = descriptor.region_byte_len(request);
        let component_width = descriptor.component_type().size_in_bytes();
        let swap = descriptor.byte_order() != ByteOrder::native();
        let descriptor = descriptor.clone();

        let command = CommandLine::new("read").args(worker_region.tokens());
        self.channel.write_line(&command).await?;

        match self.next_response().await? {
            ResponseLine::BinaryLength(len) if len == expected => {}
            ResponseLine::BinaryLength(len) => {
                return Err(BridgeError::desync(format!(
                    "worker announced {len} bytes, region needs {expected}"
                )));
            }
            other => return Err(unexpected(command.verb(), &other)),
        }
        let payload = self.channel.read_exact(expected, self.read_timeout).await?;
        self.expect_ack(command.verb()).await?;

        let mut pixels = region::to_host_order(&descriptor, &worker_region, &payload)?;
        if swap {
            swap_byte_order(&mut pixels, component_width);
        }
        Ok(pixels)
    }

    /// Create `path` for writing with the given geometry.
    ///
    /// The descriptor's dimension order is the layout the worker stores.
    pub async fn create(&mut self, path: &Path, descriptor: &ImageDescriptor) -> Result<()> {
        let worker_axes = parse_order(descriptor.dimension_order(), &descriptor.axis_names())?;
        let wire_type = descriptor.component_type().wire_type();

        let mut command = CommandLine::new("create")
            .path(path)
            .arg(descriptor.dimension_order())
            .arg(to_remote(wire_type))
            .arg(descriptor.component_count())
            .arg(ByteOrder::native().as_str());
        for axis in worker_axes.iter().filter_map(|a| descriptor.axis(*a)) {
            command = command.arg(format!("{}:{}", axis.size, axis.spacing));
        }

        // A failed create leaves nothing open.
        self.descriptor = None;
        self.mode = None;
        self.channel.write_line(&command).await?;
        self.expect_ack(command.verb()).await?;

        tracing::debug!(
            path = %path.display(),
            order = descriptor.dimension_order(),
            component_type = %descriptor.component_type(),
            wire_type = %wire_type,
            "Created image for writing"
        );
        self.descriptor = Some(descriptor.clone().with_byte_order(ByteOrder::native()));
        self.mode = Some(OpenMode::Write);
        Ok(())
    }

    /// Write a host-order region of native-endian pixels.
    pub async fn write_region(&mut self, request: &RegionRequest, pixels: &[u8]) -> Result<()> {
        let descriptor = self.writing()?;
        request.validate(descriptor)?;
        let expected = descriptor.region_byte_len(request);
        if pixels.len() != expected {
            return Err(BridgeError::BufferSize {
                expected,
                actual: pixels.len(),
            });
        }

        let worker_region = region::to_worker_order(descriptor, request)?;
        let ordered = region::to_worker_buffer(descriptor, &worker_region, pixels)?;
        let component_type = descriptor.component_type();
        let payload = widen_components(&ordered, component_type, component_type.wire_type())?;

        let command = CommandLine::new("write").args(worker_region.tokens());
        self.channel.write_line(&command).await?;
        self.channel
            .write_line(&CommandLine::new(BYTES_TOKEN).arg(payload.len()))
            .await?;
        self.channel.write_payload(Bytes::from(payload)).await?;
        self.expect_ack(command.verb()).await
    }

    /// Close whatever is open. A no-op when nothing is.
    pub async fn close(&mut self) -> Result<()> {
        if self.mode.take().is_none() {
            return Ok(());
        }
        self.descriptor = None;
        let command = CommandLine::new("close");
        self.channel.write_line(&command).await?;
        self.expect_ack(command.verb()).await
    }

    fn reading(&self, action: &str) -> Result<&ImageDescriptor> {
        match (&self.mode, &self.descriptor) {
            (Some(OpenMode::Read), Some(descriptor)) => Ok(descriptor),
            _ => Err(BridgeError::NotOpen(format!(
                "describe a file before trying to {action}"
            ))),
        }
    }

    fn writing(&self) -> Result<&ImageDescriptor> {
        match (&self.mode, &self.descriptor) {
            (Some(OpenMode::Write), Some(descriptor)) => Ok(descriptor),
            _ => Err(BridgeError::NotOpen(
                "write image information before writing a region".to_string(),
            )),
        }
    }

    async fn next_response(&mut self) -> Result<ResponseLine> {
        let line = self.channel.read_line(self.read_timeout).await?;
        match ResponseLine::classify(&line, &self.error_marker)? {
            ResponseLine::Error(message) => Err(BridgeError::RemoteOperation(message)),
            response => Ok(response),
        }
    }

    async fn expect_ack(&mut self, verb: &str) -> Result<()> {
        match self.next_response().await? {
            ResponseLine::Ack => Ok(()),
            other => Err(unexpected(verb, &other)),
        }
    }

    /// All lines up to `done`. Nothing is interpreted until the block is
    /// complete, so a failure midway leaves the caller's state untouched.
    async fn collect_block(&mut self, verb: &str) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            match self.next_response().await? {
                ResponseLine::Ack => return Ok(lines),
                ResponseLine::Metadata(line) => lines.push(line),
                other => return Err(unexpected(verb, &other)),
            }
        }
    }
}

fn unexpected(verb: &str, response: &ResponseLine) -> BridgeError {
    BridgeError::desync(format!("unexpected response to '{verb}': {response:?}"))
}

fn parse_describe(block: &[String], series: usize) -> Result<ImageDescriptor> {
    let mut lines = block.iter().map(|line| (line, line.split_whitespace().collect::<Vec<_>>()));

    let order = match lines.next() {
        Some((_, tokens)) if tokens.len() == 2 && tokens[0] == "order" => tokens[1].to_string(),
        Some((line, _)) => {
            return Err(BridgeError::desync(format!(
                "expected order line, got '{line}'"
            )));
        }
        None => return Err(BridgeError::desync("empty describe block")),
    };

    let mut axes = Vec::with_capacity(order.len());
    for expected in order.chars() {
        let (line, tokens) = lines.next().ok_or_else(|| {
            BridgeError::desync(format!("describe block ended before axis {expected}"))
        })?;
        let [name, size, spacing] = tokens.as_slice() else {
            return Err(BridgeError::desync(format!("bad axis line '{line}'")));
        };
        let mut chars = name.chars();
        let (Some(c), None) = (chars.next(), chars.next()) else {
            return Err(BridgeError::desync(format!("bad axis name in '{line}'")));
        };
        if c != expected {
            return Err(BridgeError::desync(format!(
                "axis {c} listed where order '{order}' has {expected}"
            )));
        }
        let name = AxisName::from_char(c).ok_or(BridgeError::UnsupportedAxis(c))?;
        let size: u64 = size
            .parse()
            .map_err(|_| BridgeError::desync(format!("bad axis size in '{line}'")))?;
        let spacing: f64 = spacing
            .parse()
            .map_err(|_| BridgeError::desync(format!("bad axis spacing in '{line}'")))?;
        axes.push(AxisInfo::new(name, size, spacing));
    }

    let (series_count, type_code, components) = match lines.next() {
        Some((line, tokens)) => match tokens.as_slice() {
            [count, code, components] => (
                count.parse::<usize>(),
                code.parse::<u8>(),
                components.parse::<usize>(),
            ),
            _ => return Err(BridgeError::desync(format!("bad summary line '{line}'"))),
        },
        None => return Err(BridgeError::desync("describe block ended before summary line")),
    };
    let (Ok(series_count), Ok(type_code), Ok(components)) = (series_count, type_code, components)
    else {
        return Err(BridgeError::desync("unparseable summary line"));
    };

    let mut byte_order = ByteOrder::Little;
    let mut metadata = BTreeMap::new();
    for (line, tokens) in lines {
        match tokens.as_slice() {
            ["endian", token] => {
                byte_order = ByteOrder::parse(token)
                    .ok_or_else(|| BridgeError::desync(format!("bad byte order in '{line}'")))?;
            }
            ["meta", key, ..] => {
                // Value is the raw remainder so inner spacing survives.
                let value = line
                    .trim_start()
                    .strip_prefix("meta")
                    .map(str::trim_start)
                    .and_then(|rest| rest.strip_prefix(*key))
                    .map(str::trim_start)
                    .unwrap_or_default()
                    .to_string();
                metadata.insert(decode_token(key)?, value);
            }
            _ => return Err(BridgeError::desync(format!("unexpected describe line '{line}'"))),
        }
    }

    ImageDescriptor::from_worker(
        &order,
        axes,
        series_count,
        series,
        to_local(type_code),
        components,
        byte_order,
    )
    .map(|d| d.with_metadata(metadata))
    .map_err(|e| match e {
        // The worker contradicted the index it was asked for.
        BridgeError::SeriesOutOfRange { index, count } => BridgeError::desync(format!(
            "worker reports {count} series while describing series {index}"
        )),
        other => other,
    })
}
