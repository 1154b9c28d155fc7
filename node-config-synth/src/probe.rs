use std::{
    collections::BTreeMap,
    ffi::{CStr, CString},
    fs, io, mem,
    net::{Ipv4Addr, Ipv6Addr},
    path::{Path, PathBuf},
    ptr,
    sync::Mutex,
};

use anyhow::{Context, Result, anyhow};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use node_config_common::MacAddr;
use serde::Deserialize;
use tracing::debug;

use crate::features::KernelCapabilities;
use crate::identity::{InterfaceObservation, InterfaceObservations};

const SYS_CLASS_NET: &str = "/sys/class/net";
const CPU_POSSIBLE: &str = "/sys/devices/system/cpu/possible";

/// First kernel with LRU hash maps.
const LRU_MAPS_SINCE: (u32, u32) = (4, 10);
/// First kernel with sock_ops programs.
const SOCK_OPS_SINCE: (u32, u32) = (4, 13);

pub trait ObservationSource: Send + Sync {
    fn observe(&self) -> Result<InterfaceObservations>;
}

pub trait CapabilitySource: Send + Sync {
    fn capabilities(&self) -> Result<KernelCapabilities>;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ObservationFile {
    #[serde(default)]
    kernel: KernelCapabilities,
    #[serde(default)]
    interfaces: BTreeMap<String, InterfaceEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InterfaceEntry {
    index: u32,
    mac: Option<String>,
    mtu: Option<u32>,
    #[serde(default)]
    addresses: Vec<IpNet>,
}

impl InterfaceEntry {
    fn into_observation(self, name: &str) -> Result<InterfaceObservation> {
        let mac = match self.mac {
            Some(raw) => Some(
                raw.parse::<MacAddr>()
                    .map_err(|err| anyhow!("interface {name}: invalid MAC {raw:?}: {err}"))?,
            ),
            None => None,
        };
        Ok(InterfaceObservation {
            index: self.index,
            mac,
            mtu: self.mtu,
            addresses: self.addresses,
        })
    }
}

/// Parses an observation file: `[kernel]` plus one `[interfaces.<name>]`
/// table per device.
pub fn parse_observations(raw: &str) -> Result<(InterfaceObservations, KernelCapabilities)> {
    let file: ObservationFile = toml::from_str(raw).context("failed to parse observations")?;
    let mut interfaces = BTreeMap::new();
    for (name, entry) in file.interfaces {
        let observation = entry.into_observation(&name)?;
        interfaces.insert(name, observation);
    }
    Ok((InterfaceObservations { interfaces }, file.kernel))
}

/// Observations read from a TOML file. The file is re-read on every call so
/// edits show up as interface changes.
pub struct StaticSource {
    path: PathBuf,
}

impl StaticSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<(InterfaceObservations, KernelCapabilities)> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read observations at {}", self.path.display()))?;
        parse_observations(&raw)
            .with_context(|| format!("invalid observations at {}", self.path.display()))
    }
}

impl ObservationSource for StaticSource {
    fn observe(&self) -> Result<InterfaceObservations> {
        Ok(self.load()?.0)
    }
}

impl CapabilitySource for StaticSource {
    fn capabilities(&self) -> Result<KernelCapabilities> {
        Ok(self.load()?.1)
    }
}

/// Observations held in memory and replaced by the embedder.
pub struct MemorySource {
    state: Mutex<(InterfaceObservations, KernelCapabilities)>,
}

impl MemorySource {
    pub fn new(observations: InterfaceObservations, capabilities: KernelCapabilities) -> Self {
        Self {
            state: Mutex::new((observations, capabilities)),
        }
    }

    pub fn set_observations(&self, observations: InterfaceObservations) {
        self.state.lock().expect("memory source mutex poisoned").0 = observations;
    }

    pub fn set_capabilities(&self, capabilities: KernelCapabilities) {
        self.state.lock().expect("memory source mutex poisoned").1 = capabilities;
    }
}

impl ObservationSource for MemorySource {
    fn observe(&self) -> Result<InterfaceObservations> {
        Ok(self.state.lock().expect("memory source mutex poisoned").0.clone())
    }
}

impl CapabilitySource for MemorySource {
    fn capabilities(&self) -> Result<KernelCapabilities> {
        Ok(self.state.lock().expect("memory source mutex poisoned").1)
    }
}

/// Probes the running host through sysfs and libc.
#[derive(Clone, Debug)]
pub struct SysfsProbe {
    net_root: PathBuf,
}

impl Default for SysfsProbe {
    fn default() -> Self {
        Self {
            net_root: PathBuf::from(SYS_CLASS_NET),
        }
    }
}

impl SysfsProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_attr(&self, iface: &str, attr: &str) -> Option<String> {
        fs::read_to_string(self.net_root.join(iface).join(attr))
            .ok()
            .map(|raw| raw.trim().to_string())
    }
}

impl ObservationSource for SysfsProbe {
    fn observe(&self) -> Result<InterfaceObservations> {
        let mut addresses = interface_addresses()?;
        let entries = fs::read_dir(&self.net_root)
            .with_context(|| format!("failed to list {}", self.net_root.display()))?;

        let mut interfaces = BTreeMap::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to list {}", self.net_root.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let index = if_index(&name)?;
            if index == 0 {
                // vanished between listing and lookup
                continue;
            }
            let mac = self.read_attr(&name, "address").and_then(|raw| raw.parse().ok());
            let mtu = self.read_attr(&name, "mtu").and_then(|raw| raw.parse().ok());
            interfaces.insert(
                name.clone(),
                InterfaceObservation {
                    index,
                    mac,
                    mtu,
                    addresses: addresses.remove(&name).unwrap_or_default(),
                },
            );
        }
        debug!(count = interfaces.len(), "probed interfaces");
        Ok(InterfaceObservations { interfaces })
    }
}

impl CapabilitySource for SysfsProbe {
    fn capabilities(&self) -> Result<KernelCapabilities> {
        let release = kernel_release()?;
        let version = parse_kernel_release(&release)
            .ok_or_else(|| anyhow!("unrecognised kernel release {release:?}"))?;
        let possible = fs::read_to_string(CPU_POSSIBLE)
            .with_context(|| format!("failed to read {CPU_POSSIBLE}"))?;
        let possible_cpus = parse_cpu_list(&possible)
            .ok_or_else(|| anyhow!("malformed cpu list {:?}", possible.trim()))?;
        let caps = KernelCapabilities {
            lru_maps: version >= LRU_MAPS_SINCE,
            sock_ops: version >= SOCK_OPS_SINCE,
            possible_cpus,
        };
        debug!(%release, ?caps, "probed kernel capabilities");
        Ok(caps)
    }
}

fn if_index(name: &str) -> Result<u32> {
    let ifname = CString::new(name).with_context(|| format!("invalid interface name {name:?}"))?;
    Ok(unsafe { libc::if_nametoindex(ifname.as_ptr()) })
}

fn kernel_release() -> Result<String> {
    let mut uts: libc::utsname = unsafe { mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return Err(io::Error::last_os_error()).context("uname failed");
    }
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
    Ok(release.to_string_lossy().into_owned())
}

fn interface_addresses() -> Result<BTreeMap<String, Vec<IpNet>>> {
    let mut head: *mut libc::ifaddrs = ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return Err(io::Error::last_os_error()).context("getifaddrs failed");
    }

    let mut out: BTreeMap<String, Vec<IpNet>> = BTreeMap::new();
    let mut cursor = head;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;
        if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
            continue;
        }
        let name = unsafe { CStr::from_ptr(entry.ifa_name) }
            .to_string_lossy()
            .into_owned();
        let net = match i32::from(unsafe { (*entry.ifa_addr).sa_family }) {
            libc::AF_INET => {
                let addr = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
                let prefix = if entry.ifa_netmask.is_null() {
                    32
                } else {
                    let mask = unsafe { &*(entry.ifa_netmask as *const libc::sockaddr_in) };
                    u32::from_be(mask.sin_addr.s_addr).count_ones() as u8
                };
                Ipv4Net::new(ip, prefix).ok().map(IpNet::V4)
            }
            libc::AF_INET6 => {
                let addr = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
                let prefix = if entry.ifa_netmask.is_null() {
                    128
                } else {
                    let mask = unsafe { &*(entry.ifa_netmask as *const libc::sockaddr_in6) };
                    mask.sin6_addr.s6_addr.iter().map(|b| b.count_ones()).sum::<u32>() as u8
                };
                Ipv6Net::new(ip, prefix).ok().map(IpNet::V6)
            }
            _ => None,
        };
        if let Some(net) = net {
            out.entry(name).or_default().push(net);
        }
    }
    unsafe { libc::freeifaddrs(head) };
    Ok(out)
}

/// `"5.15.0-91-generic"` → `(5, 15)`.
pub fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.trim().split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Counts CPUs in a sysfs list such as `"0-3,8,10-11"`.
pub fn parse_cpu_list(raw: &str) -> Option<u32> {
    let mut total = 0u32;
    for part in raw.trim().split(',').filter(|p| !p.is_empty()) {
        let count = match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.parse().ok()?;
                let hi: u32 = hi.parse().ok()?;
                hi.checked_sub(lo)?.checked_add(1)?
            }
            None => {
                part.parse::<u32>().ok()?;
                1
            }
        };
        total = total.checked_add(count)?;
    }
    (total > 0).then_some(total)
}

/// Reads `path` once; used by the one-shot CLI paths.
pub fn load_static(path: &Path) -> Result<(InterfaceObservations, KernelCapabilities)> {
    StaticSource::new(path).load()
}
