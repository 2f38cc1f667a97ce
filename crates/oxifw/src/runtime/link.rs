//! Linking registered classes.
//!
//! Linking resolves each class's superclass by name (superclass first),
//! computes the instance layout, builds the metaclass and resolves adopted
//! protocols. A failure leaves the offending class, and everything that
//! inherits from it, unlinked; unrelated classes still link.
//!
//! # Layout
//!
//! A root instance starts with one pointer-sized class slot. Each ivar is
//! placed at the next offset aligned to its natural alignment, and the
//! instance size is the end of the last ivar. A subclass starts where its
//! superclass's instance ends, so inherited offsets never move.

use crate::error::{Error, OrFatal, Result};
use crate::runtime::class::{Class, Ivar, Layout};
use crate::runtime::encoding::{align_up, ivar_layout};
use crate::runtime::{ClassTable, Runtime, write_lock};

const CLASS_SLOT: usize = std::mem::size_of::<usize>();

struct Linker<'a> {
    runtime: &'a Runtime,
    classes: &'a ClassTable,
    visiting: Vec<String>,
    linked: Vec<Class>,
}

impl Linker<'_> {
    fn link_one(&mut self, class: &Class) -> Result<()> {
        if class.is_linked() {
            return Ok(());
        }
        if self.visiting.iter().any(|name| name == class.name()) {
            let mut cycle = self.visiting.join(" -> ");
            cycle.push_str(" -> ");
            cycle.push_str(class.name());
            return Err(Error::MalformedHierarchy {
                name: class.name().to_string(),
                reason: format!("inheritance cycle {cycle}"),
            });
        }

        let superclass = match class.superclass_name() {
            None => None,
            Some(parent) => {
                let Some(parent_class) = self.classes.get(parent).cloned() else {
                    return Err(Error::MalformedHierarchy {
                        name: class.name().to_string(),
                        reason: format!("superclass '{parent}' is not registered"),
                    });
                };
                self.visiting.push(class.name().to_string());
                let linked = self.link_one(&parent_class);
                self.visiting.pop();
                linked?;
                Some(parent_class)
            }
        };

        let layout = layout(class, superclass.as_ref())?;
        let protocols = self
            .runtime
            .resolve_protocols(class.name(), class.protocol_names())?;
        let metaclass = Class::new_metaclass(class, superclass.as_ref());

        oxifw_log::debug!(
            "linked {} : {} (size {}, {} ivar(s))",
            class.name(),
            superclass.as_ref().map_or("<root>", Class::name),
            layout.instance_size,
            layout.ivars.len()
        );
        class.finish_link(superclass, layout, metaclass, protocols);
        self.linked.push(class.clone());
        Ok(())
    }
}

fn layout(class: &Class, superclass: Option<&Class>) -> Result<Layout> {
    let mut offset = match superclass {
        Some(parent) => parent.instance_size().ok_or_else(|| parent.not_linked())?,
        None => CLASS_SLOT,
    };

    let mut ivars = Vec::with_capacity(class.ivar_descriptors().len());
    for desc in class.ivar_descriptors() {
        if let Some(parent) = superclass
            && parent.ivar(&desc.name).is_some()
        {
            return Err(Error::DuplicateRegistration {
                name: format!("{}.{}", class.name(), desc.name),
            });
        }
        let (type_char, size, align) = ivar_layout(&desc.types)?;
        offset = align_up(offset, align);
        ivars.push(Ivar {
            name: desc.name.as_str().into(),
            type_char,
            size,
            offset,
        });
        offset += size;
    }

    Ok(Layout {
        instance_size: offset,
        ivars,
    })
}

impl Runtime {
    /// Links every registered class that is not linked yet, then merges
    /// categories waiting for them.
    ///
    /// Returns the number of classes linked by this call.
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::MalformedHierarchy`] (missing superclass,
    /// inheritance cycle, unknown protocol) or layout error encountered,
    /// including one from a pending category. Classes and categories
    /// unaffected by it are linked and merged anyway.
    pub fn try_link(&self) -> Result<usize> {
        let classes = write_lock(&self.classes);

        let mut linker = Linker {
            runtime: self,
            classes: &classes,
            visiting: Vec::new(),
            linked: Vec::new(),
        };
        let mut first_error = None;
        for class in classes.values() {
            if let Err(err) = linker.link_one(class) {
                oxifw_log::debug!("failed to link {}: {err}", class.name());
                first_error.get_or_insert(err);
            }
        }
        let linked = std::mem::take(&mut linker.linked);
        drop(classes);

        let merged = match self.merge_pending_categories() {
            Ok(merged) => merged,
            Err(err) => {
                first_error.get_or_insert(err);
                0
            }
        };

        match first_error {
            Some(err) => Err(err),
            None => {
                if !linked.is_empty() || merged > 0 {
                    oxifw_log::debug!(
                        "link pass: {} class(es) linked, {merged} category(ies) merged",
                        linked.len()
                    );
                }
                Ok(linked.len())
            }
        }
    }

    /// Links, treating failure as fatal. Returns the number of classes
    /// linked.
    pub fn link(&self) -> usize {
        self.try_link().or_fatal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::class::ClassDescriptor;

    const PTR: usize = std::mem::size_of::<usize>();

    #[test]
    fn test_root_layout_starts_after_class_slot() {
        let rt = Runtime::new();
        let class = rt.register_class(ClassDescriptor::root("Pair").ivar("a", "c").ivar("b", "i"));
        assert_eq!(rt.link(), 1);

        let ivars = class.ivars();
        assert_eq!(ivars[0].offset, PTR);
        assert_eq!(ivars[1].offset, PTR + 4);
        assert_eq!(class.instance_size(), Some(PTR + 8));
    }

    #[test]
    fn test_subclass_extends_superclass_layout() {
        let rt = Runtime::new();
        let base = rt.register_class(ClassDescriptor::root("Base").ivar("flag", "B"));
        let derived =
            rt.register_class(ClassDescriptor::subclass("Derived", "Base").ivar("value", "d"));
        rt.link();

        assert_eq!(base.instance_size(), Some(PTR + 1));
        assert_eq!(derived.ivar("value").unwrap().offset, align_up(PTR + 1, 8));
        assert_eq!(derived.instance_size(), Some(align_up(PTR + 1, 8) + 8));
        assert_eq!(derived.ivar("flag").unwrap().offset, PTR);
        assert_eq!(derived.superclass(), Some(base));
    }

    #[test]
    fn test_registration_order_does_not_matter() {
        let rt = Runtime::new();
        let child = rt.register_class(ClassDescriptor::subclass("Child", "Parent"));
        rt.register_class(ClassDescriptor::root("Parent"));
        assert_eq!(rt.link(), 2);
        assert!(child.is_linked());
        assert_eq!(child.superclass().unwrap().name(), "Parent");
    }

    #[test]
    fn test_cycle_is_malformed() {
        let rt = Runtime::new();
        rt.register_class(ClassDescriptor::subclass("A", "B"));
        rt.register_class(ClassDescriptor::subclass("B", "A"));
        let err = rt.try_link().unwrap_err();
        assert!(
            matches!(err, Error::MalformedHierarchy { ref reason, .. } if reason.starts_with("inheritance cycle"))
        );
        assert!(!rt.get_class("A").is_linked());
        assert!(!rt.get_class("B").is_linked());
    }

    #[test]
    fn test_missing_superclass_spares_unrelated_classes() {
        let rt = Runtime::new();
        rt.register_class(ClassDescriptor::subclass("Stray", "Ghost"));
        let fine = rt.register_class(ClassDescriptor::root("Fine"));
        let err = rt.try_link().unwrap_err();
        assert_eq!(
            err,
            Error::MalformedHierarchy {
                name: "Stray".into(),
                reason: "superclass 'Ghost' is not registered".into()
            }
        );
        assert!(fine.is_linked());

        // Registering the missing superclass lets a later pass finish.
        rt.register_class(ClassDescriptor::root("Ghost"));
        assert_eq!(rt.link(), 2);
    }

    #[test]
    fn test_unknown_protocol_is_malformed() {
        let rt = Runtime::new();
        rt.register_class(ClassDescriptor::root("Adopter").adopts("Nothing"));
        assert!(matches!(rt.try_link(), Err(Error::MalformedHierarchy { .. })));
    }

    #[test]
    fn test_shadowed_ivar_is_duplicate() {
        let rt = Runtime::new();
        rt.register_class(ClassDescriptor::root("Top").ivar("x", "i"));
        rt.register_class(ClassDescriptor::subclass("Bottom", "Top").ivar("x", "i"));
        assert_eq!(
            rt.try_link().unwrap_err(),
            Error::DuplicateRegistration { name: "Bottom.x".into() }
        );
    }

    #[test]
    fn test_metaclass_chain() {
        let rt = Runtime::new();
        let root = rt.register_class(ClassDescriptor::root("Root"));
        let leaf = rt.register_class(ClassDescriptor::subclass("Leaf", "Root"));
        rt.link();

        let root_meta = root.metaclass().unwrap();
        let leaf_meta = leaf.metaclass().unwrap();
        assert!(leaf_meta.is_metaclass());
        assert_eq!(leaf_meta.superclass(), Some(root_meta.clone()));
        assert_eq!(root_meta.superclass(), Some(root.clone()));
        assert_eq!(leaf_meta.instance_class(), Some(leaf.clone()));
        assert_eq!(leaf.class_object().unwrap().class(), &leaf_meta);
    }

    #[test]
    fn test_relink_is_noop() {
        let rt = Runtime::new();
        rt.register_class(ClassDescriptor::root("Once"));
        assert_eq!(rt.link(), 1);
        assert_eq!(rt.link(), 0);
    }
}
