//! Host ⇄ worker axis-order translation for regions and pixel buffers.
//!
//! Both sides lay buffers out with the first axis of their order varying
//! fastest and interleaved components innermost, so a translation is a pure
//! permutation of whole pixels.

use crate::descriptor::{AxisName, ImageDescriptor, RegionRequest, parse_order};
use crate::error::{BridgeError, Result};

/// A region in worker axis order, ready to be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRegion {
    axes: Vec<AxisName>,
    origin: Vec<u64>,
    extent: Vec<u64>,
}

impl WorkerRegion {
    pub fn axes(&self) -> &[AxisName] {
        &self.axes
    }

    pub fn origin(&self) -> &[u64] {
        &self.origin
    }

    pub fn extent(&self) -> &[u64] {
        &self.extent
    }

    /// `origin extent` pairs, one per axis in worker order.
    pub fn tokens(&self) -> Vec<String> {
        self.origin
            .iter()
            .zip(&self.extent)
            .flat_map(|(o, e)| [o.to_string(), e.to_string()])
            .collect()
    }

    /// Undo [`to_worker_order`].
    pub fn to_host_region(&self) -> RegionRequest {
        let mut entries: Vec<(AxisName, u64, u64)> = self
            .axes
            .iter()
            .zip(self.origin.iter().zip(&self.extent))
            .map(|(a, (o, e))| (*a, *o, *e))
            .collect();
        entries.sort_by_key(|(a, _, _)| a.host_rank());
        RegionRequest {
            origin: entries.iter().map(|(_, o, _)| *o).collect(),
            extent: entries.iter().map(|(_, _, e)| *e).collect(),
        }
    }

    fn extent_of(&self, axis: AxisName) -> usize {
        self.axes
            .iter()
            .position(|a| *a == axis)
            .map(|i| self.extent[i] as usize)
            .unwrap_or(1)
    }
}

/// Permute a host-order region into the descriptor's worker order.
pub fn to_worker_order(
    descriptor: &ImageDescriptor,
    region: &RegionRequest,
) -> Result<WorkerRegion> {
    let host_axes = descriptor.axis_names();
    let worker_axes = parse_order(descriptor.dimension_order(), &host_axes)?;

    if region.origin.len() != host_axes.len() || region.extent.len() != host_axes.len() {
        return Err(BridgeError::invalid_region(format!(
            "expected {} axes, got origin {} / extent {}",
            host_axes.len(),
            region.origin.len(),
            region.extent.len()
        )));
    }

    let mut origin = Vec::with_capacity(worker_axes.len());
    let mut extent = Vec::with_capacity(worker_axes.len());
    for axis in &worker_axes {
        // parse_order guarantees every worker axis is a host axis.
        let i = host_axes.iter().position(|a| a == axis).ok_or_else(|| {
            BridgeError::AxisOrderMismatch {
                order: descriptor.dimension_order().to_string(),
                axes: host_axes.iter().map(|a| a.as_char()).collect(),
            }
        })?;
        origin.push(region.origin[i]);
        extent.push(region.extent[i]);
    }

    Ok(WorkerRegion {
        axes: worker_axes,
        origin,
        extent,
    })
}

/// Rearrange a worker-order pixel buffer for `region` into host order.
pub fn to_host_order(
    descriptor: &ImageDescriptor,
    region: &WorkerRegion,
    buffer: &[u8],
) -> Result<Vec<u8>> {
    let host_axes = descriptor.axis_names();
    permute(buffer, region, &region.axes, &host_axes, descriptor.bytes_per_pixel())
}

/// Rearrange a host-order pixel buffer for `region` into worker order.
pub fn to_worker_buffer(
    descriptor: &ImageDescriptor,
    region: &WorkerRegion,
    buffer: &[u8],
) -> Result<Vec<u8>> {
    let host_axes = descriptor.axis_names();
    permute(buffer, region, &host_axes, &region.axes, descriptor.bytes_per_pixel())
}

fn permute(
    buffer: &[u8],
    region: &WorkerRegion,
    from: &[AxisName],
    to: &[AxisName],
    pixel_bytes: usize,
) -> Result<Vec<u8>> {
    let pixels = region
        .extent
        .iter()
        .try_fold(1usize, |acc, e| acc.checked_mul(usize::try_from(*e).ok()?))
        .ok_or_else(|| BridgeError::invalid_region("region volume overflows"))?;
    let expected = pixels
        .checked_mul(pixel_bytes)
        .ok_or_else(|| BridgeError::invalid_region("region byte length overflows"))?;
    if buffer.len() != expected {
        return Err(BridgeError::BufferSize {
            expected,
            actual: buffer.len(),
        });
    }

    if pixels == 0 {
        return Ok(Vec::new());
    }

    // Axes of extent 1 do not affect memory layout.
    let significant = |axes: &[AxisName]| -> Vec<AxisName> {
        axes.iter()
            .copied()
            .filter(|a| region.extent_of(*a) > 1)
            .collect()
    };
    if significant(from) == significant(to) {
        return Ok(buffer.to_vec());
    }

    // Source stride (in pixels) of every axis, indexed by host rank.
    let mut source_stride = [0usize; 5];
    let mut stride = 1;
    for axis in from {
        source_stride[axis.host_rank()] = stride;
        stride *= region.extent_of(*axis);
    }

    let dest_extent: Vec<usize> = to.iter().map(|a| region.extent_of(*a)).collect();
    let dest_step: Vec<usize> = to.iter().map(|a| source_stride[a.host_rank()]).collect();

    let mut out = Vec::with_capacity(expected);
    let mut index = vec![0usize; to.len()];
    let mut source = 0usize;
    for _ in 0..pixels {
        let offset = source * pixel_bytes;
        out.extend_from_slice(&buffer[offset..offset + pixel_bytes]);

        for d in 0..to.len() {
            index[d] += 1;
            source += dest_step[d];
            if index[d] < dest_extent[d] {
                break;
            }
            source -= dest_step[d] * dest_extent[d];
            index[d] = 0;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::AxisInfo;
    use crate::pixel::{ByteOrder, ComponentType};

    fn descriptor(order: &str, sizes: &[(AxisName, u64)], components: usize) -> ImageDescriptor {
        let axes = sizes
            .iter()
            .map(|(name, size)| AxisInfo::new(*name, *size, 1.0))
            .collect();
        ImageDescriptor::from_worker(
            order,
            axes,
            1,
            0,
            ComponentType::UChar,
            components,
            ByteOrder::Little,
        )
        .unwrap()
    }

    #[test]
    fn region_is_permuted_into_worker_order() {
        let d = descriptor("ZXY", &[(AxisName::X, 4), (AxisName::Y, 3), (AxisName::Z, 2)], 1);
        let region = RegionRequest::new(vec![1, 2, 0], vec![3, 1, 2]);

        let worker = to_worker_order(&d, &region).unwrap();
        assert_eq!(worker.axes(), &[AxisName::Z, AxisName::X, AxisName::Y]);
        assert_eq!(worker.origin(), &[0, 1, 2]);
        assert_eq!(worker.extent(), &[2, 3, 1]);
        assert_eq!(worker.tokens(), vec!["0", "2", "1", "3", "2", "1"]);
    }

    #[test]
    fn region_permutation_round_trips() {
        let sizes = [
            (AxisName::X, 5),
            (AxisName::Y, 4),
            (AxisName::Z, 3),
            (AxisName::T, 2),
            (AxisName::C, 2),
        ];
        for order in ["XYZTC", "XYCZT", "CTZYX", "ZXCYT", "TCXYZ"] {
            let d = descriptor(order, &sizes, 1);
            for region in [
                d.full_region(),
                RegionRequest::new(vec![1, 0, 2, 1, 0], vec![3, 4, 1, 1, 2]),
                RegionRequest::new(vec![4, 3, 2, 1, 1], vec![1, 1, 1, 1, 1]),
            ] {
                let worker = to_worker_order(&d, &region).unwrap();
                assert_eq!(worker.to_host_region(), region, "order {order}");
            }
        }
    }

    #[test]
    fn transposes_two_axes() {
        // Worker sends Y fastest: values are y*10 + x laid out as (y, x).
        let d = descriptor("YX", &[(AxisName::X, 3), (AxisName::Y, 2)], 1);
        let worker = to_worker_order(&d, &d.full_region()).unwrap();
        let worker_buf = vec![0, 10, 1, 11, 2, 12];

        let host = to_host_order(&d, &worker, &worker_buf).unwrap();
        assert_eq!(host, vec![0, 1, 2, 10, 11, 12]);
    }

    #[test]
    fn components_move_with_their_pixel() {
        let d = descriptor("YX", &[(AxisName::X, 2), (AxisName::Y, 2)], 3);
        let worker = to_worker_order(&d, &d.full_region()).unwrap();
        // Pixel (x, y) has components [xy0, xy1, xy2], worker order (y fastest).
        let worker_buf = vec![
            0, 1, 2, // x0 y0
            10, 11, 12, // x0 y1
            100, 101, 102, // x1 y0
            110, 111, 112, // x1 y1
        ];
        let host = to_host_order(&d, &worker, &worker_buf).unwrap();
        assert_eq!(
            host,
            vec![0, 1, 2, 100, 101, 102, 10, 11, 12, 110, 111, 112]
        );
    }

    #[test]
    fn buffer_permutation_round_trips() {
        let sizes = [(AxisName::X, 4), (AxisName::Y, 3), (AxisName::Z, 2), (AxisName::C, 2)];
        for order in ["XYZC", "CZYX", "ZCXY", "YXCZ"] {
            let d = descriptor(order, &sizes, 2);
            let region = RegionRequest::new(vec![1, 0, 0, 1], vec![3, 2, 2, 1]);
            let worker = to_worker_order(&d, &region).unwrap();

            let host: Vec<u8> = (0..d.region_byte_len(&region)).map(|i| i as u8).collect();
            let on_wire = to_worker_buffer(&d, &worker, &host).unwrap();
            let back = to_host_order(&d, &worker, &on_wire).unwrap();
            assert_eq!(back, host, "order {order}");
        }
    }

    #[test]
    fn unit_extent_axes_skip_the_copy() {
        let d = descriptor("ZXY", &[(AxisName::X, 4), (AxisName::Y, 3), (AxisName::Z, 2)], 1);
        let region = RegionRequest::new(vec![0, 0, 1], vec![4, 3, 1]);
        let worker = to_worker_order(&d, &region).unwrap();
        let buf: Vec<u8> = (0..12).collect();
        assert_eq!(to_host_order(&d, &worker, &buf).unwrap(), buf);
    }

    #[test]
    fn wrong_buffer_length_is_rejected() {
        let d = descriptor("YX", &[(AxisName::X, 3), (AxisName::Y, 2)], 1);
        let worker = to_worker_order(&d, &d.full_region()).unwrap();
        let err = to_host_order(&d, &worker, &[0; 5]).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::BufferSize {
                expected: 6,
                actual: 5
            }
        ));
    }

    #[test]
    fn overflowing_region_is_an_error() {
        let d = descriptor("YX", &[(AxisName::X, 3), (AxisName::Y, 2)], 1);
        let region = RegionRequest::new(vec![0, 0], vec![u64::MAX, u64::MAX]);
        let worker = to_worker_order(&d, &region).unwrap();
        let err = to_host_order(&d, &worker, &[0; 6]).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRegion(_)));
    }

    #[test]
    fn region_with_wrong_rank_is_rejected() {
        let d = descriptor("YX", &[(AxisName::X, 3), (AxisName::Y, 2)], 1);
        let err = to_worker_order(&d, &RegionRequest::new(vec![0], vec![1])).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRegion(_)));
    }
}
