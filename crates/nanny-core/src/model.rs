//! Entities observed by the nannies.
//!
//! Everything here is a flat record. Cross-links between records are ids
//! (volume ids, instance ids, manager-local references) and traversal is a
//! map lookup, so snapshots never contain cycles and serialize trivially.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type VolumeId = Uuid;
pub type InstanceId = Uuid;
pub type AttachmentId = Uuid;
/// Virtualization-manager local reference ("vm-1234", "datastore-77").
pub type Moid = String;

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const MIB: u64 = 1024 * 1024;

/// Memory size of a shadow VM in MB.
pub const SHADOW_VM_MEMORY_MB: u64 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VolumeStatus {
    Creating,
    Available,
    Attaching,
    InUse,
    Detaching,
    Deleting,
    Reserved,
    Error,
    ErrorDeleting,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeStatus::Creating => "creating",
            VolumeStatus::Available => "available",
            VolumeStatus::Attaching => "attaching",
            VolumeStatus::InUse => "in-use",
            VolumeStatus::Detaching => "detaching",
            VolumeStatus::Deleting => "deleting",
            VolumeStatus::Reserved => "reserved",
            VolumeStatus::Error => "error",
            VolumeStatus::ErrorDeleting => "error_deleting",
        }
    }

    /// States a volume must leave within the configured dwell bound.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VolumeStatus::Creating
                | VolumeStatus::Attaching
                | VolumeStatus::Detaching
                | VolumeStatus::Deleting
                | VolumeStatus::Reserved
        )
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VolumeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(VolumeStatus::Creating),
            "available" => Ok(VolumeStatus::Available),
            "attaching" => Ok(VolumeStatus::Attaching),
            "in-use" => Ok(VolumeStatus::InUse),
            "detaching" => Ok(VolumeStatus::Detaching),
            "deleting" => Ok(VolumeStatus::Deleting),
            "reserved" => Ok(VolumeStatus::Reserved),
            "error" => Ok(VolumeStatus::Error),
            "error_deleting" => Ok(VolumeStatus::ErrorDeleting),
            other => Err(format!("unknown volume status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttachStatus {
    Attached,
    Detached,
    Attaching,
    Detaching,
    Reserved,
    ErrorAttaching,
    ErrorDetaching,
}

impl AttachStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachStatus::Attached => "attached",
            AttachStatus::Detached => "detached",
            AttachStatus::Attaching => "attaching",
            AttachStatus::Detaching => "detaching",
            AttachStatus::Reserved => "reserved",
            AttachStatus::ErrorAttaching => "error_attaching",
            AttachStatus::ErrorDetaching => "error_detaching",
        }
    }
}

impl fmt::Display for AttachStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttachStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attached" => Ok(AttachStatus::Attached),
            "detached" => Ok(AttachStatus::Detached),
            "attaching" => Ok(AttachStatus::Attaching),
            "detaching" => Ok(AttachStatus::Detaching),
            "reserved" => Ok(AttachStatus::Reserved),
            "error_attaching" => Ok(AttachStatus::ErrorAttaching),
            "error_detaching" => Ok(AttachStatus::ErrorDetaching),
            other => Err(format!("unknown attach status: {}", other)),
        }
    }
}

/// A live row of the storage DB's `volume_attachment` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub id: AttachmentId,
    pub volume_id: VolumeId,
    pub instance_id: Option<InstanceId>,
    pub device_name: Option<String>,
    pub attach_status: Option<AttachStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,
    pub project: String,
    pub status: VolumeStatus,
    pub attach_status: AttachStatus,
    pub size_bytes: u64,
    pub host: Option<String>,
    pub availability_zone: Option<String>,
    pub attachments: Vec<VolumeAttachment>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Volume {
    /// Instances this volume is attached to according to the storage DB.
    pub fn attached_instances(&self) -> BTreeSet<InstanceId> {
        self.attachments
            .iter()
            .filter_map(|a| a.instance_id)
            .collect()
    }

    pub fn attachment_for(&self, instance: &InstanceId) -> Option<&VolumeAttachment> {
        self.attachments
            .iter()
            .find(|a| a.instance_id.as_ref() == Some(instance))
    }
}

/// A live row of the compute DB's `block_device_mapping` table that
/// references a volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    pub id: i64,
    pub instance_id: InstanceId,
    pub volume_id: VolumeId,
    pub attachment_id: Option<AttachmentId>,
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub project: String,
    pub display_name: String,
    pub availability_zone: Option<String>,
    pub host: Option<String>,
    pub status: String,
    pub block_devices: Vec<BlockDeviceMapping>,
    /// Port ids recorded in the instance's network info cache.
    pub port_ids: BTreeSet<Uuid>,
}

impl Instance {
    pub fn attached_volume_ids(&self) -> BTreeSet<VolumeId> {
        self.block_devices.iter().map(|b| b.volume_id).collect()
    }

    pub fn mapping_for(&self, volume: &VolumeId) -> Option<&BlockDeviceMapping> {
        self.block_devices.iter().find(|b| &b.volume_id == volume)
    }
}

/// A property fetched from the virtualization manager's property collector.
///
/// The collector omits unset paths entirely; that case is kept distinct from
/// an empty value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Property<T> {
    Present(T),
    #[default]
    Absent,
}

impl<T> Property<T> {
    pub fn get(&self) -> Option<&T> {
        match self {
            Property::Present(v) => Some(v),
            Property::Absent => None,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Property::Present(_))
    }
}

impl<T> From<Option<T>> for Property<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Property::Present(v),
            None => Property::Absent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Green,
    Yellow,
    Red,
    Gray,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharesLevel {
    Low,
    Normal,
    High,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runtime {
    pub power_state: PowerState,
    pub host: Option<Moid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualDisk {
    pub key: i32,
    pub backing_filename: String,
    pub backing_uuid: Option<Uuid>,
    pub capacity_bytes: u64,
    pub datastore: Option<Moid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualNic {
    pub key: i32,
    pub mac_address: String,
    /// Network port id carried by the opaque-network backing, if any.
    pub port_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HardwareDevice {
    Disk(VirtualDisk),
    Nic(VirtualNic),
    Other { key: i32, label: String },
}

/// Property paths requested for every VM per cycle.
pub const VM_PROPERTY_PATHS: &[&str] = &[
    "hardware.device",
    "hardware.memoryMB",
    "config.name",
    "config.instanceUuid",
    "config.annotation",
    "config.extraConfig",
    "config.template",
    "config.files.vmPathName",
    "config.memoryAllocation.shares",
    "overallStatus",
    "runtime",
];

/// Any virtualization-manager VM, shadow or instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmObject {
    pub moid: Moid,
    pub config_name: Property<String>,
    pub instance_uuid: Property<Uuid>,
    pub annotation: Property<String>,
    pub hardware_devices: Property<Vec<HardwareDevice>>,
    pub extra_config: Property<BTreeMap<String, String>>,
    pub memory_mb: Property<u64>,
    pub template: Property<bool>,
    pub vm_path_name: Property<String>,
    pub memory_shares: Property<SharesLevel>,
    pub overall_status: Property<OverallStatus>,
    pub runtime: Property<Runtime>,
}

impl VmObject {
    pub fn new(moid: impl Into<Moid>) -> Self {
        Self {
            moid: moid.into(),
            config_name: Property::Absent,
            instance_uuid: Property::Absent,
            annotation: Property::Absent,
            hardware_devices: Property::Absent,
            extra_config: Property::Absent,
            memory_mb: Property::Absent,
            template: Property::Absent,
            vm_path_name: Property::Absent,
            memory_shares: Property::Absent,
            overall_status: Property::Absent,
            runtime: Property::Absent,
        }
    }

    pub fn disks(&self) -> impl Iterator<Item = &VirtualDisk> {
        self.hardware_devices
            .get()
            .into_iter()
            .flatten()
            .filter_map(|d| match d {
                HardwareDevice::Disk(disk) => Some(disk),
                _ => None,
            })
    }

    pub fn nics(&self) -> impl Iterator<Item = &VirtualNic> {
        self.hardware_devices
            .get()
            .into_iter()
            .flatten()
            .filter_map(|d| match d {
                HardwareDevice::Nic(nic) => Some(nic),
                _ => None,
            })
    }

    pub fn power_state(&self) -> Option<PowerState> {
        self.runtime.get().map(|r| r.power_state)
    }

    pub fn is_powered_on(&self) -> bool {
        self.power_state() == Some(PowerState::PoweredOn)
    }

    pub fn runtime_host(&self) -> Option<&Moid> {
        self.runtime.get().and_then(|r| r.host.as_ref())
    }

    pub fn is_template(&self) -> bool {
        self.template.get().copied().unwrap_or(false)
    }

    /// Volume ids recorded as `volume-<id>` extra-config keys.
    pub fn extra_config_volumes(&self) -> BTreeMap<Uuid, String> {
        self.extra_config
            .get()
            .into_iter()
            .flatten()
            .filter_map(|(k, v)| {
                let id = k.strip_prefix("volume-")?;
                Uuid::parse_str(id).ok().map(|id| (id, v.clone()))
            })
            .collect()
    }

    pub fn has_annotation(&self) -> bool {
        self.annotation.get().map(|a| !a.is_empty()).unwrap_or(false)
    }

    /// A shadow VM owns the backing file of one block volume: 128 MB of
    /// memory, powered off, one disk, no network interface, named after the
    /// volume.
    pub fn is_shadow(&self) -> bool {
        let named_by_uuid = self
            .config_name
            .get()
            .map(|n| Uuid::parse_str(n).is_ok())
            .unwrap_or(false);
        named_by_uuid
            && self.memory_mb.get() == Some(&SHADOW_VM_MEMORY_MB)
            && self.power_state() == Some(PowerState::PoweredOff)
            && self.disks().count() == 1
            && self.nics().count() == 0
            && !self.is_template()
    }

    /// Volume id of a shadow VM, taken from its name.
    pub fn shadow_volume_id(&self) -> Option<VolumeId> {
        if !self.is_shadow() {
            return None;
        }
        self.config_name.get().and_then(|n| Uuid::parse_str(n).ok())
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.get().copied().unwrap_or(0) * MIB
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatastoreKind {
    Vvol,
    Vmfs,
    Nfs,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datastore {
    pub moid: Moid,
    pub name: String,
    pub kind: DatastoreKind,
    pub capacity_bytes: u64,
    pub free_bytes: u64,
    pub overall_status: Property<OverallStatus>,
    pub resident_vms: Vec<Moid>,
}

impl Datastore {
    pub fn used_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.free_bytes)
    }

    pub fn usage_percent(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes() as f64 / self.capacity_bytes as f64) * 100.0
    }
}

/// One folder of a datastore as returned by a recursive browse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderListing {
    /// Folder path relative to the datastore root.
    pub folder: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    NotResponding,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub moid: Moid,
    pub name: String,
    pub memory_bytes: u64,
    pub resident_vms: Vec<Moid>,
    pub connection_state: ConnectionState,
    pub maintenance: bool,
    pub cluster: Option<Moid>,
}

impl Host {
    pub fn is_usable(&self) -> bool {
        self.connection_state == ConnectionState::Connected && !self.maintenance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DrsBehavior {
    Manual,
    PartiallyAutomated,
    FullyAutomated,
}

impl DrsBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrsBehavior::Manual => "manual",
            DrsBehavior::PartiallyAutomated => "partiallyAutomated",
            DrsBehavior::FullyAutomated => "fullyAutomated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub moid: Moid,
    pub name: String,
    pub hosts: Vec<Moid>,
    /// Per-VM DRS overrides currently installed on the cluster.
    pub drs_overrides: BTreeMap<Moid, DrsBehavior>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub name: String,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlexVol {
    pub name: String,
    pub aggregate: String,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub usage_percent: f64,
    pub snapshot_reserve_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lun {
    pub path: String,
    pub flexvol: String,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
}
