//! Proximity discovery: radio events in, discovery batches out.

pub mod events;
pub mod machine;

pub use events::{
    LocationPermission, ObservedBeacon, ProximityListener, RadioEvent, RadioPermission, RegionState,
};
pub use machine::{
    run_event_loop, spawn_event_loop, AdvertisementPayload, BeaconIdentity, BeaconRadio,
    BlockReason, PermissionPrompter, Phase, ProximityError, ProximityStateMachine, RegionSpec,
};
