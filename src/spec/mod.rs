//! Deployment specification model
//!
//! In-memory representation of a compose deployment: services, networks,
//! volumes and their port bindings. Specs are plain data; every function
//! here is side-effect free.

pub mod model;
pub mod port;

pub use model::{
    classify_source, classify_source_for, normalize_image, parse_memory, Healthcheck,
    MountSource, NetworkDef, RefKind, ResourceLimits, RestartPolicy, ServiceDef, Spec,
    UnresolvedRef, VolumeDef, VolumeMount, DEFAULT_NETWORK,
};
pub use port::{PortBinding, PortSpec, Protocol};
