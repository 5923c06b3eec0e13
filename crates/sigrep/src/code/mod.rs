//! Code identity graph: running code, its hosts and guests, and the cached
//! static (on-disk) counterpart of each node.
//!
//! A [`Code`] represents an instance of running code. Every node except the
//! root has a host; guests retain their hosts, so a host chain is a finite
//! acyclic path ending at the root. How a particular kind of code finds its
//! static representation and its guests is supplied by a [`CodeDriver`].
//!
//! A node's static code is computed once and reused; callers wanting fresh
//! validation locate a new node rather than relying on implicit refresh.

pub mod static_code;

pub use static_code::StaticCode;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::debug;

use crate::rep::{best_guess, DiskRep};
use crate::{Error, Result};

/// Validation flags.
pub type Flags = u32;

/// No special validation behavior.
pub const FLAG_DEFAULT: Flags = 0;

/// Validate the signature envelope only; skip resource checks.
pub const FLAG_BASIC_ONLY: Flags = 1 << 0;

/// Upper bound on host-chain depth, guarding guest resolution against
/// runaway or cyclic hosting topologies.
pub const MAX_HOST_DEPTH: usize = 64;

/// Well-known guest attribute: process identifier.
pub const GUEST_ATTR_PID: &str = "pid";

/// Well-known guest attribute: signing identifier.
pub const GUEST_ATTR_IDENTIFIER: &str = "identifier";

/// Well-known guest attribute: host-specific opaque token.
pub const GUEST_ATTR_TOKEN: &str = "token";

/// One guest attribute value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttributeValue {
    Int(i64),
    Str(String),
    Data(Vec<u8>),
}

/// A kind-specific attribute mapping identifying a guest to its host:
/// a process identifier, a signing identifier, an in-process plugin
/// token, or any combination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestAttributes {
    entries: BTreeMap<String, AttributeValue>,
}

impl GuestAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pid(mut self, pid: i64) -> Self {
        self.entries
            .insert(GUEST_ATTR_PID.to_string(), AttributeValue::Int(pid));
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.entries.insert(
            GUEST_ATTR_IDENTIFIER.to_string(),
            AttributeValue::Str(identifier.into()),
        );
        self
    }

    pub fn with_token(mut self, token: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(
            GUEST_ATTR_TOKEN.to_string(),
            AttributeValue::Data(token.into()),
        );
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: AttributeValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.entries.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether every attribute in `self` is present with an equal value in
    /// `other`. A lookup request matches a guest when the request is a
    /// subset of the guest's registered attributes.
    pub fn subset_of(&self, other: &GuestAttributes) -> bool {
        self.entries
            .iter()
            .all(|(k, v)| other.entries.get(k) == Some(v))
    }
}

/// External evaluation entry point consumed by validity checking.
///
/// Cryptographic signature verification and requirement evaluation live
/// outside this layer; failures surface as validity errors, not crashes.
pub trait Validator: Send + Sync {
    fn validate(&self, code: &StaticCode, flags: Flags) -> Result<()>;
}

/// Kind-specific behavior of a code instance: how it locates its own
/// static representation and how it resolves and judges its guests.
pub trait CodeDriver: Send + Sync {
    /// Locate the on-disk representation of this running code.
    fn locate_static_code(&self) -> Result<Arc<dyn DiskRep>>;

    /// Find the guest of `host` matching the given attributes.
    fn locate_guest(&self, host: &Arc<Code>, attrs: &GuestAttributes) -> Result<Arc<Code>>;

    /// The host's view of a guest's static identity. Hosts may report a
    /// narrower identity than the guest would claim for itself.
    fn map_guest_to_static(&self, guest: &Arc<Code>) -> Result<Arc<StaticCode>> {
        guest.static_code()
    }

    /// Host-observed status flags for a guest. No special status by
    /// default.
    fn guest_status(&self, _guest: &Arc<Code>) -> Result<u32> {
        Ok(0)
    }
}

/// A running code instance in the identity graph.
pub struct Code {
    /// Back-reference to the owning `Arc`, so guests can retain this node
    /// as their host.
    self_ref: Weak<Code>,
    host: Option<Arc<Code>>,
    driver: Box<dyn CodeDriver>,
    /// Static code plus the identification snapshot taken when it was
    /// resolved. Computed once; never implicitly refreshed.
    resolved: Mutex<Option<(Arc<StaticCode>, Vec<u8>)>>,
    located_by: Option<GuestAttributes>,
}

impl Code {
    /// Create a root node (no host) with the given driver.
    pub fn root(driver: Box<dyn CodeDriver>) -> Arc<Code> {
        Arc::new_cyclic(|me| Code {
            self_ref: me.clone(),
            host: None,
            driver,
            resolved: Mutex::new(None),
            located_by: None,
        })
    }

    /// Create a root node hosting explicitly registered guests.
    pub fn hosting(registry: Arc<GuestRegistry>) -> Arc<Code> {
        Self::root(Box::new(RegistryDriver { registry }))
    }

    /// Create a guest node of `host`. Used by drivers when materializing
    /// located guests.
    pub fn guest_of(
        host: &Arc<Code>,
        driver: Box<dyn CodeDriver>,
        located_by: GuestAttributes,
    ) -> Arc<Code> {
        Arc::new_cyclic(|me| Code {
            self_ref: me.clone(),
            host: Some(host.clone()),
            driver,
            resolved: Mutex::new(None),
            located_by: Some(located_by),
        })
    }

    fn to_arc(&self) -> Arc<Code> {
        // the weak self reference is set at construction and outlives
        // every `&self`
        self.self_ref.upgrade().expect("live code node")
    }

    pub fn host(&self) -> Option<&Arc<Code>> {
        self.host.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.host.is_none()
    }

    /// The attributes this node was located under, if it was located as a
    /// guest.
    pub fn located_attributes(&self) -> Option<&GuestAttributes> {
        self.located_by.as_ref()
    }

    /// Number of hosts above this node. Zero for the root.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.host();
        while let Some(host) = current {
            depth += 1;
            current = host.host();
        }
        depth
    }

    /// The cached static code of this node, resolved on first access and
    /// reused for the node's lifetime.
    pub fn static_code(&self) -> Result<Arc<StaticCode>> {
        let mut resolved = self.resolved.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((code, _)) = resolved.as_ref() {
            return Ok(code.clone());
        }
        let rep = self.driver.locate_static_code()?;
        let code = Arc::new(StaticCode::new(rep));
        let ident = code.identification()?;
        *resolved = Some((code.clone(), ident));
        Ok(code)
    }

    /// Locate the guest of this node matching the given attributes.
    pub fn locate_guest(&self, attrs: &GuestAttributes) -> Result<Arc<Code>> {
        if attrs.is_empty() {
            return Err(Error::UnsupportedGuestAttributes(
                "empty attribute set".into(),
            ));
        }
        let me = self.to_arc();
        let guest = self.driver.locate_guest(&me, attrs)?;
        if !guest.host().is_some_and(|host| Arc::ptr_eq(host, &me)) {
            return Err(Error::NotAHost);
        }
        if guest.depth() > MAX_HOST_DEPTH {
            return Err(Error::HostingCycle);
        }
        Ok(guest)
    }

    /// The static code of `guest` as seen by this host.
    pub fn map_guest_to_static(&self, guest: &Arc<Code>) -> Result<Arc<StaticCode>> {
        self.require_guest(guest)?;
        self.driver.map_guest_to_static(guest)
    }

    /// Host-observed status flags for `guest`.
    pub fn guest_status(&self, guest: &Arc<Code>) -> Result<u32> {
        self.require_guest(guest)?;
        self.driver.guest_status(guest)
    }

    fn require_guest(&self, guest: &Arc<Code>) -> Result<()> {
        let related = guest
            .host()
            .is_some_and(|host| std::ptr::eq(Arc::as_ptr(host), self));
        if related {
            Ok(())
        } else {
            Err(Error::NotAHost)
        }
    }

    /// Validate this code's current static code against its signature and
    /// requirements. Fails if the code on disk no longer matches the
    /// identity this node resolved to.
    pub fn check_validity(&self, flags: Flags, validator: &dyn Validator) -> Result<()> {
        let static_code = self.static_code()?;
        let snapshot = {
            let resolved = self.resolved.lock().unwrap_or_else(|e| e.into_inner());
            resolved
                .as_ref()
                .map(|(_, ident)| ident.clone())
                .unwrap_or_default()
        };

        // re-derive the identification from disk: the node's identity is
        // fixed, so drift means the code changed underneath us
        let fresh = best_guess(static_code.canonical_path())?.identification()?;
        if fresh != snapshot {
            debug!(path = %static_code.canonical_path().display(), "on-disk identity drifted");
            return Err(Error::StaticCodeChanged);
        }
        static_code.validate(validator, flags)
    }
}

impl std::fmt::Debug for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Code")
            .field("root", &self.is_root())
            .field("depth", &self.depth())
            .finish()
    }
}

/// Walk down from `root`, trying [`Code::locate_guest`] at each level, and
/// return the deepest guest matching the attributes. The walk is bounded by
/// [`MAX_HOST_DEPTH`]; exhaustion without a match is [`Error::NoSuchGuest`],
/// never a partial answer.
pub fn auto_locate_guest(
    root: &Arc<Code>,
    attrs: &GuestAttributes,
    _flags: Flags,
) -> Result<Arc<Code>> {
    let mut current = root.clone();
    let mut found: Option<Arc<Code>> = None;
    for _ in 0..MAX_HOST_DEPTH {
        match current.locate_guest(attrs) {
            Ok(guest) => {
                found = Some(guest.clone());
                current = guest;
            }
            Err(Error::NoSuchGuest) => break,
            Err(e) => return Err(e),
        }
    }
    found.ok_or(Error::NoSuchGuest)
}

/// Explicitly registered guest table: the hosting kind shipped with this
/// layer. The embedding program registers each guest's attributes and its
/// own registry, forming a hosting tree that [`Code::hosting`] exposes as
/// the identity graph.
pub struct GuestRegistry {
    executable: Option<PathBuf>,
    guests: RwLock<Vec<GuestEntry>>,
}

struct GuestEntry {
    attrs: GuestAttributes,
    registry: Arc<GuestRegistry>,
    status: u32,
}

impl GuestRegistry {
    /// A registry for code with no on-disk representation of its own
    /// (the system root).
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            executable: None,
            guests: RwLock::new(Vec::new()),
        })
    }

    /// A registry for code backed by an executable on disk.
    pub fn for_executable(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            executable: Some(path.into()),
            guests: RwLock::new(Vec::new()),
        })
    }

    /// Register a guest under the given attributes.
    pub fn register(&self, attrs: GuestAttributes, guest: Arc<GuestRegistry>) {
        self.guests
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(GuestEntry {
                attrs,
                registry: guest,
                status: 0,
            });
    }

    /// Record host-observed status flags for a registered guest.
    pub fn set_guest_status(&self, attrs: &GuestAttributes, status: u32) -> Result<()> {
        let mut guests = self.guests.write().unwrap_or_else(|e| e.into_inner());
        for entry in guests.iter_mut() {
            if &entry.attrs == attrs {
                entry.status = status;
                return Ok(());
            }
        }
        Err(Error::NoSuchGuest)
    }
}

struct RegistryDriver {
    registry: Arc<GuestRegistry>,
}

impl CodeDriver for RegistryDriver {
    fn locate_static_code(&self) -> Result<Arc<dyn DiskRep>> {
        match &self.registry.executable {
            Some(path) => best_guess(path),
            None => Err(Error::StaticCodeNotFound(
                "code has no on-disk representation".into(),
            )),
        }
    }

    fn locate_guest(&self, host: &Arc<Code>, attrs: &GuestAttributes) -> Result<Arc<Code>> {
        let guests = self.registry.guests.read().unwrap_or_else(|e| e.into_inner());
        let mut matches = guests.iter().filter(|entry| attrs.subset_of(&entry.attrs));
        let Some(entry) = matches.next() else {
            return Err(Error::NoSuchGuest);
        };
        if matches.next().is_some() {
            return Err(Error::MultipleGuests);
        }
        Ok(Code::guest_of(
            host,
            Box::new(RegistryDriver {
                registry: entry.registry.clone(),
            }),
            entry.attrs.clone(),
        ))
    }

    fn guest_status(&self, guest: &Arc<Code>) -> Result<u32> {
        let Some(located_by) = guest.located_attributes() else {
            return Ok(0);
        };
        let guests = self.registry.guests.read().unwrap_or_else(|e| e.into_inner());
        guests
            .iter()
            .find(|entry| &entry.attrs == located_by)
            .map(|entry| entry.status)
            .ok_or(Error::NoSuchGuest)
    }
}
