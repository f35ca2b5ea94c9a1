//! scifio-bridge: read and write scientific image formats through an
//! out-of-process SCIFIO worker speaking a line protocol over its pipes.

pub mod channel;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod io;
pub mod logging;
pub mod pixel;
pub mod protocol;
pub mod region;
pub mod supervisor;
mod version;

pub use config::{BridgeConfig, LaunchSpec};
pub use descriptor::{AxisInfo, AxisName, HOST_ORDER, ImageDescriptor, RegionRequest};
pub use error::{BridgeError, Result};
pub use io::ScifioImageIO;
pub use pixel::{ByteOrder, ComponentType, FALLBACK_CODE, to_local, to_remote};
pub use protocol::{CommandProtocol, ErrorMarker};
pub use region::WorkerRegion;
pub use supervisor::{ProcessSupervisor, WorkerProtocol, WorkerReady};
pub use version::{BRIDGE_VERSION, VersionInfo};
