//! Negotiated image geometry.
//!
//! Axes are stored in host order (`XYZTC`, fastest first). The worker's own
//! dimension order string is kept alongside so regions and buffers can be
//! translated (see [`crate::region`]).

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{BridgeError, Result};
use crate::pixel::{ByteOrder, ComponentType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AxisName {
    X,
    Y,
    Z,
    T,
    C,
}

/// Host axis order, fastest-varying first.
pub const HOST_ORDER: [AxisName; 5] = [
    AxisName::X,
    AxisName::Y,
    AxisName::Z,
    AxisName::T,
    AxisName::C,
];

impl AxisName {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'X' => Some(Self::X),
            'Y' => Some(Self::Y),
            'Z' => Some(Self::Z),
            'T' => Some(Self::T),
            'C' => Some(Self::C),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Self::X => 'X',
            Self::Y => 'Y',
            Self::Z => 'Z',
            Self::T => 'T',
            Self::C => 'C',
        }
    }

    pub(crate) fn host_rank(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for AxisName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AxisInfo {
    pub name: AxisName,
    pub size: u64,
    pub spacing: f64,
}

impl AxisInfo {
    pub fn new(name: AxisName, size: u64, spacing: f64) -> Self {
        Self {
            name,
            size,
            spacing,
        }
    }
}

/// Parse a dimension order string and check it names exactly `axes`.
pub(crate) fn parse_order(order: &str, axes: &[AxisName]) -> Result<Vec<AxisName>> {
    let mut parsed = Vec::with_capacity(order.len());
    for c in order.chars() {
        let axis = AxisName::from_char(c).ok_or(BridgeError::UnsupportedAxis(c))?;
        parsed.push(axis);
    }

    let mut sorted_order = parsed.clone();
    sorted_order.sort();
    let mut sorted_axes = axes.to_vec();
    sorted_axes.sort();
    let unique = sorted_order.windows(2).all(|w| w[0] != w[1]);

    if !unique || sorted_order != sorted_axes {
        return Err(BridgeError::AxisOrderMismatch {
            order: order.to_string(),
            axes: axes.iter().map(|a| a.as_char()).collect(),
        });
    }
    Ok(parsed)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageDescriptor {
    axes: Vec<AxisInfo>,
    series_count: usize,
    series: usize,
    component_type: ComponentType,
    component_count: usize,
    dimension_order: String,
    byte_order: ByteOrder,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    metadata: BTreeMap<String, String>,
}

impl ImageDescriptor {
    /// Host-side descriptor, e.g. for a file about to be written.
    ///
    /// The dimension order defaults to host order and the byte order to native.
    pub fn new(
        axes: Vec<AxisInfo>,
        component_type: ComponentType,
        component_count: usize,
    ) -> Result<Self> {
        let names: Vec<AxisName> = axes.iter().map(|a| a.name).collect();
        let order: String = HOST_ORDER
            .iter()
            .filter(|a| names.contains(a))
            .map(|a| a.as_char())
            .collect();
        // Also rejects duplicate axes.
        if order.len() != axes.len() {
            return Err(BridgeError::AxisOrderMismatch {
                order,
                axes: names.iter().map(|a| a.as_char()).collect(),
            });
        }
        Self::from_worker(
            &order,
            axes,
            1,
            0,
            component_type,
            component_count,
            ByteOrder::native(),
        )
        .map_err(|e| match e {
            BridgeError::ProtocolDesync(message) => BridgeError::InvalidRegion(message),
            other => other,
        })
    }

    /// Descriptor as reported by the worker. `axes` may be in any order; the
    /// order string must be a permutation of their names.
    pub fn from_worker(
        dimension_order: &str,
        mut axes: Vec<AxisInfo>,
        series_count: usize,
        series: usize,
        component_type: ComponentType,
        component_count: usize,
        byte_order: ByteOrder,
    ) -> Result<Self> {
        let names: Vec<AxisName> = axes.iter().map(|a| a.name).collect();
        parse_order(dimension_order, &names)?;

        if series >= series_count {
            return Err(BridgeError::SeriesOutOfRange {
                index: series,
                count: series_count,
            });
        }
        if component_count == 0 {
            return Err(BridgeError::desync("component count must be positive"));
        }

        axes.sort_by_key(|a| a.name.host_rank());
        if checked_image_bytes(&axes, component_type, component_count).is_none() {
            return Err(BridgeError::desync(format!(
                "image of {:?} x {component_count} {component_type} does not fit in memory",
                axes.iter().map(|a| a.size).collect::<Vec<_>>()
            )));
        }
        Ok(Self {
            axes,
            series_count,
            series,
            component_type,
            component_count,
            dimension_order: dimension_order.to_string(),
            byte_order,
            metadata: BTreeMap::new(),
        })
    }

    /// Choose the worker dimension order, e.g. before writing.
    pub fn with_dimension_order(mut self, order: &str) -> Result<Self> {
        parse_order(order, &self.axis_names())?;
        self.dimension_order = order.to_string();
        Ok(self)
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub(crate) fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn axes(&self) -> &[AxisInfo] {
        &self.axes
    }

    pub fn axis_names(&self) -> Vec<AxisName> {
        self.axes.iter().map(|a| a.name).collect()
    }

    pub fn axis(&self, name: AxisName) -> Option<&AxisInfo> {
        self.axes.iter().find(|a| a.name == name)
    }

    pub fn size(&self, name: AxisName) -> Option<u64> {
        self.axis(name).map(|a| a.size)
    }

    pub fn spacing(&self, name: AxisName) -> Option<f64> {
        self.axis(name).map(|a| a.spacing)
    }

    /// Sizes in host order.
    pub fn dimensions(&self) -> Vec<u64> {
        self.axes.iter().map(|a| a.size).collect()
    }

    pub fn number_of_dimensions(&self) -> usize {
        self.axes.len()
    }

    pub fn series_count(&self) -> usize {
        self.series_count
    }

    pub fn series(&self) -> usize {
        self.series
    }

    pub fn component_type(&self) -> ComponentType {
        self.component_type
    }

    pub fn component_count(&self) -> usize {
        self.component_count
    }

    pub fn dimension_order(&self) -> &str {
        &self.dimension_order
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.component_type.size_in_bytes() * self.component_count
    }

    pub fn pixel_count(&self) -> u64 {
        self.axes.iter().map(|a| a.size).product()
    }

    pub fn image_size_in_bytes(&self) -> usize {
        self.pixel_count() as usize * self.bytes_per_pixel()
    }

    /// Region covering the whole current series.
    pub fn full_region(&self) -> RegionRequest {
        RegionRequest {
            origin: vec![0; self.axes.len()],
            extent: self.dimensions(),
        }
    }

    /// Payload length of `region`: volume × component size × component count.
    ///
    /// Saturates for regions that do not fit the image; [`RegionRequest::validate`]
    /// rejects those first.
    pub fn region_byte_len(&self, region: &RegionRequest) -> usize {
        usize::try_from(region.volume())
            .unwrap_or(usize::MAX)
            .saturating_mul(self.bytes_per_pixel())
    }
}

/// Byte size of a whole image, `None` if any partial product overflows.
///
/// Every size accessor on [`ImageDescriptor`] relies on this having
/// succeeded at construction.
fn checked_image_bytes(
    axes: &[AxisInfo],
    component_type: ComponentType,
    component_count: usize,
) -> Option<usize> {
    let pixel_bytes = component_type.size_in_bytes().checked_mul(component_count)?;
    let pixels = axes
        .iter()
        .try_fold(1u64, |acc, axis| acc.checked_mul(axis.size))?;
    usize::try_from(pixels).ok()?.checked_mul(pixel_bytes)
}

/// Host-order origin and extent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionRequest {
    pub origin: Vec<u64>,
    pub extent: Vec<u64>,
}

impl RegionRequest {
    pub fn new(origin: Vec<u64>, extent: Vec<u64>) -> Self {
        Self { origin, extent }
    }

    /// Number of pixels, saturating at `u64::MAX`.
    pub fn volume(&self) -> u64 {
        self.extent
            .iter()
            .fold(1u64, |acc, extent| acc.saturating_mul(*extent))
    }

    /// Check the region against the current series' bounds.
    pub fn validate(&self, descriptor: &ImageDescriptor) -> Result<()> {
        let dims = descriptor.number_of_dimensions();
        if self.origin.len() != dims || self.extent.len() != dims {
            return Err(BridgeError::invalid_region(format!(
                "expected {} axes, got origin {} / extent {}",
                dims,
                self.origin.len(),
                self.extent.len()
            )));
        }

        for (i, axis) in descriptor.axes().iter().enumerate() {
            let (origin, extent) = (self.origin[i], self.extent[i]);
            if extent == 0 {
                return Err(BridgeError::invalid_region(format!(
                    "extent along {} is zero",
                    axis.name
                )));
            }
            let end = origin.checked_add(extent).ok_or_else(|| {
                BridgeError::invalid_region(format!("region along {} overflows", axis.name))
            })?;
            if end > axis.size {
                return Err(BridgeError::invalid_region(format!(
                    "{}: {}..{} exceeds size {}",
                    axis.name, origin, end, axis.size
                )));
            }
        }
        Ok(())
    }
}
