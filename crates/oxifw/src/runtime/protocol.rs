//! Protocols and conformance.
//!
//! A [`Protocol`] names a set of required method signatures and may adopt
//! other protocols. Protocols are uniqued by name per runtime and compared by
//! identity. Registration resolves adopted names against the batch being
//! registered and the protocols already known, rejecting unknown names and
//! adoption cycles, so the registered graph is always acyclic.
//!
//! Conformance is transitive through adoption and additive down the class
//! hierarchy: see [`Class::conforms_to`].

use fxhash::FxBuildHasher;
use indexmap::{IndexMap, IndexSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{Error, OrFatal, Result};
use crate::runtime::class::Class;
use crate::runtime::selector::Selector;
use crate::runtime::{Runtime, read_lock, write_lock};

pub(crate) type ProtocolTable = IndexMap<String, Protocol, FxBuildHasher>;

/// Required method of a protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    /// Selector name.
    pub name: String,
    /// Optional type encoding.
    pub types: Option<String>,
}

/// Protocol metadata as produced by a code generator.
///
/// ```
/// use oxifw::ProtocolDescriptor;
///
/// let greeter = ProtocolDescriptor::new("Greeter")
///     .adopts("Named")
///     .requires("greet");
/// assert_eq!(greeter.adopts, vec!["Named".to_string()]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolDescriptor {
    /// Protocol name.
    pub name: String,
    /// Required methods.
    pub required: Vec<MethodSignature>,
    /// Names of adopted protocols.
    pub adopts: Vec<String>,
}

impl ProtocolDescriptor {
    /// Starts an empty protocol.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            required: Vec::new(),
            adopts: Vec::new(),
        }
    }

    /// Adds a required method without a signature.
    #[must_use]
    pub fn requires(mut self, name: &str) -> Self {
        self.required.push(MethodSignature {
            name: name.to_string(),
            types: None,
        });
        self
    }

    /// Adds a required method with a signature.
    #[must_use]
    pub fn requires_typed(mut self, name: &str, types: &str) -> Self {
        self.required.push(MethodSignature {
            name: name.to_string(),
            types: Some(types.to_string()),
        });
        self
    }

    /// Adopts another protocol by name.
    #[must_use]
    pub fn adopts(mut self, name: &str) -> Self {
        self.adopts.push(name.to_string());
        self
    }
}

struct ProtocolInner {
    descriptor: ProtocolDescriptor,
    required: Vec<Selector>,
    adopted: Vec<Protocol>,
}

/// Registered protocol. Equality is identity.
#[derive(Clone)]
pub struct Protocol(Arc<ProtocolInner>);

impl Protocol {
    fn new(descriptor: ProtocolDescriptor, adopted: Vec<Protocol>) -> Self {
        let required = descriptor
            .required
            .iter()
            .map(|sig| Selector::intern(&sig.name))
            .collect();
        Protocol(Arc::new(ProtocolInner {
            descriptor,
            required,
            adopted,
        }))
    }

    /// Protocol name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.descriptor.name
    }

    /// Selectors required by this protocol itself.
    #[must_use]
    pub fn required(&self) -> &[Selector] {
        &self.0.required
    }

    /// Directly adopted protocols.
    #[must_use]
    pub fn adopted(&self) -> &[Protocol] {
        &self.0.adopted
    }

    /// Required selectors of this protocol and everything it adopts,
    /// without duplicates.
    #[must_use]
    pub fn all_required(&self) -> Vec<Selector> {
        let mut seen = IndexSet::<Selector, FxBuildHasher>::default();
        self.collect_required(&mut seen);
        seen.into_iter().collect()
    }

    fn collect_required(&self, seen: &mut IndexSet<Selector, FxBuildHasher>) {
        seen.extend(self.0.required.iter().copied());
        for parent in &self.0.adopted {
            parent.collect_required(seen);
        }
    }

    /// Returns true if `self` is `other` or adopts it, directly or
    /// transitively.
    #[must_use]
    pub fn conforms_to(&self, other: &Protocol) -> bool {
        self == other || self.0.adopted.iter().any(|p| p.conforms_to(other))
    }

    fn same_metadata(&self, descriptor: &ProtocolDescriptor) -> bool {
        self.0.descriptor == *descriptor
    }
}

/// Returns true if both handles are the same registered protocol.
#[must_use]
pub fn protocol_is_equal(a: &Protocol, b: &Protocol) -> bool {
    a == b
}

impl PartialEq for Protocol {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Protocol {}

impl Hash for Protocol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name())
            .field("adopted", &self.0.descriptor.adopts)
            .finish()
    }
}

/// Depth-first resolution of one registration batch.
struct Batch<'a> {
    pending: IndexMap<&'a str, &'a ProtocolDescriptor, FxBuildHasher>,
    registry: &'a ProtocolTable,
    built: IndexMap<String, Protocol, FxBuildHasher>,
    visiting: Vec<&'a str>,
}

impl<'a> Batch<'a> {
    fn resolve(&mut self, name: &'a str, requested_by: Option<&str>) -> Result<Protocol> {
        if let Some(protocol) = self.built.get(name) {
            return Ok(protocol.clone());
        }

        let descriptor = self.pending.get(name).copied();
        if let Some(existing) = self.registry.get(name) {
            return match descriptor {
                Some(desc) if !existing.same_metadata(desc) => Err(Error::DuplicateRegistration {
                    name: name.to_string(),
                }),
                _ => Ok(existing.clone()),
            };
        }

        let Some(descriptor) = descriptor else {
            return Err(Error::MalformedHierarchy {
                name: requested_by.unwrap_or(name).to_string(),
                reason: format!("adopts unknown protocol '{name}'"),
            });
        };

        if self.visiting.contains(&name) {
            return Err(Error::MalformedHierarchy {
                name: name.to_string(),
                reason: format!("protocol adoption cycle through {}", self.visiting.join(" -> ")),
            });
        }

        self.visiting.push(name);
        let mut adopted = Vec::with_capacity(descriptor.adopts.len());
        for parent in &descriptor.adopts {
            adopted.push(self.resolve(parent, Some(name))?);
        }
        self.visiting.pop();

        let protocol = Protocol::new(descriptor.clone(), adopted);
        self.built.insert(name.to_string(), protocol.clone());
        Ok(protocol)
    }
}

impl Runtime {
    /// Registers a batch of protocols that may adopt each other.
    ///
    /// Either every protocol in the batch is registered or none is.
    /// Re-registering identical metadata returns the existing protocol.
    ///
    /// # Errors
    ///
    /// - [`Error::MalformedHierarchy`] for an adoption cycle or an adopted
    ///   name that is neither in the batch nor registered
    /// - [`Error::DuplicateRegistration`] if a name is already registered,
    ///   or repeated in the batch, with different metadata
    pub fn try_register_protocols(
        &self,
        descriptors: &[ProtocolDescriptor],
    ) -> Result<Vec<Protocol>> {
        let mut registry = write_lock(&self.protocols);

        let mut pending = IndexMap::with_hasher(FxBuildHasher::default());
        for desc in descriptors {
            if let Some(previous) = pending.insert(desc.name.as_str(), desc)
                && previous != desc
            {
                return Err(Error::DuplicateRegistration {
                    name: desc.name.clone(),
                });
            }
        }

        let mut batch = Batch {
            pending,
            registry: &registry,
            built: IndexMap::default(),
            visiting: Vec::new(),
        };
        let resolved = descriptors
            .iter()
            .map(|desc| batch.resolve(&desc.name, None))
            .collect::<Result<Vec<_>>>()?;
        let built = std::mem::take(&mut batch.built);

        for (name, protocol) in built {
            oxifw_log::debug!("registered protocol {name}");
            registry.insert(name, protocol);
        }
        Ok(resolved)
    }

    /// Registers a batch of protocols, treating failure as fatal.
    pub fn register_protocols(&self, descriptors: &[ProtocolDescriptor]) -> Vec<Protocol> {
        self.try_register_protocols(descriptors).or_fatal()
    }

    /// Registers one protocol.
    ///
    /// # Errors
    ///
    /// See [`Runtime::try_register_protocols`].
    pub fn try_register_protocol(&self, descriptor: ProtocolDescriptor) -> Result<Protocol> {
        let mut registered = self.try_register_protocols(std::slice::from_ref(&descriptor))?;
        registered.pop().ok_or(Error::ProtocolNotFound {
            name: descriptor.name,
        })
    }

    /// Registers one protocol, treating failure as fatal.
    pub fn register_protocol(&self, descriptor: ProtocolDescriptor) -> Protocol {
        self.try_register_protocol(descriptor).or_fatal()
    }

    /// Returns the protocol registered under `name`, if any.
    #[must_use]
    pub fn lookup_protocol(&self, name: &str) -> Option<Protocol> {
        read_lock(&self.protocols).get(name).cloned()
    }

    /// Returns the protocol registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProtocolNotFound`] if there is none.
    pub fn try_get_protocol(&self, name: &str) -> Result<Protocol> {
        self.lookup_protocol(name).ok_or_else(|| Error::ProtocolNotFound {
            name: name.to_string(),
        })
    }

    /// Returns the protocol registered under `name`, treating absence as
    /// fatal.
    pub fn get_protocol(&self, name: &str) -> Protocol {
        self.try_get_protocol(name).or_fatal()
    }

    /// Names of all registered protocols.
    #[must_use]
    pub fn protocol_names(&self) -> Vec<String> {
        read_lock(&self.protocols).keys().cloned().collect()
    }

    /// Resolves protocol names for a class or category.
    pub(crate) fn resolve_protocols(&self, owner: &str, names: &[String]) -> Result<Vec<Protocol>> {
        let registry = read_lock(&self.protocols);
        names
            .iter()
            .map(|name| {
                registry.get(name.as_str()).cloned().ok_or_else(|| Error::MalformedHierarchy {
                    name: owner.to_string(),
                    reason: format!("adopts unknown protocol '{name}'"),
                })
            })
            .collect()
    }

    /// Returns true if `class` conforms to `protocol`.
    #[must_use]
    pub fn conforms_to(&self, class: &Class, protocol: &Protocol) -> bool {
        class.conforms_to(protocol)
    }

    /// Checks that `class` answers every selector `protocol` requires,
    /// including those of adopted protocols.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingProtocolMethod`] naming the first selector
    /// the class cannot answer.
    pub fn validate_conformance(&self, class: &Class, protocol: &Protocol) -> Result<()> {
        match protocol
            .all_required()
            .into_iter()
            .find(|sel| !class.responds_to(*sel))
        {
            Some(sel) => Err(Error::MissingProtocolMethod {
                class: class.name().to_string(),
                protocol: protocol.name().to_string(),
                selector: sel.name().to_string(),
            }),
            None => Ok(()),
        }
    }
}
