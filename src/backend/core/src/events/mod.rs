//! Lifecycle events shared between coordinator, executors and partition service.

pub mod bus;

pub use bus::{
    BusSubscription, ClusterEvent, ComponentLifecycleEvent, JobLifecycleEvent, LifecycleBus,
    PartitionChangeEvent, TenantLifecycleEvent,
};
