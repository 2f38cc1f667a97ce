//! Categories: methods and protocols added to an existing class.
//!
//! A category targets a class by name. Once the target is linked its
//! instance methods are merged into the class, its class methods into the
//! metaclass and its protocols into the adopted list. Merging overwrites by
//! selector and never removes anything. Categories whose target is not
//! linked yet wait in the runtime until a later [`Runtime::link`].

use fxhash::FxBuildHasher;
use hashbrown::HashSet;

use crate::error::{Error, OrFatal, Result};
use crate::runtime::class::{Class, Method};
use crate::runtime::{Runtime, lock, read_lock};

/// Category metadata.
#[derive(Debug, Clone)]
pub struct CategoryDescriptor {
    /// Category name, unique per target class.
    pub name: String,
    /// Name of the class extended.
    pub class_name: String,
    /// Instance methods.
    pub instance_methods: Vec<Method>,
    /// Class methods.
    pub class_methods: Vec<Method>,
    /// Names of additionally adopted protocols.
    pub protocols: Vec<String>,
}

impl CategoryDescriptor {
    /// Starts an empty category named `name` on `class_name`.
    #[must_use]
    pub fn new(name: &str, class_name: &str) -> Self {
        Self {
            name: name.to_string(),
            class_name: class_name.to_string(),
            instance_methods: Vec::new(),
            class_methods: Vec::new(),
            protocols: Vec::new(),
        }
    }

    /// Adds an instance method.
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.instance_methods.push(method);
        self
    }

    /// Adds a class method.
    #[must_use]
    pub fn class_method(mut self, method: Method) -> Self {
        self.class_methods.push(method);
        self
    }

    /// Adopts a protocol by name.
    #[must_use]
    pub fn adopts(mut self, protocol: &str) -> Self {
        self.protocols.push(protocol.to_string());
        self
    }

    fn label(&self) -> String {
        format!("{}({})", self.class_name, self.name)
    }
}

#[derive(Default)]
pub(crate) struct CategoryTable {
    seen: HashSet<(String, String), FxBuildHasher>,
    pending: Vec<CategoryDescriptor>,
}

impl CategoryTable {
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Runtime {
    /// Registers a category, merging it at once if its class is linked.
    ///
    /// Returns true if it was merged, false if it waits for the class.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateRegistration`] if a category of this name was
    ///   already registered for the class
    /// - [`Error::MalformedHierarchy`] if the target is linked and a
    ///   protocol name is unknown
    pub fn try_register_category(&self, category: CategoryDescriptor) -> Result<bool> {
        for method in category.instance_methods.iter().chain(&category.class_methods) {
            if let Some(types) = &method.types {
                crate::runtime::encoding::validate_method_encoding(types)?;
            }
        }

        // Held until the category is merged or queued so a concurrent link
        // either sees it pending or has already linked the target.
        let classes = read_lock(&self.classes);
        let target = classes
            .get(category.class_name.as_str())
            .filter(|class| class.is_linked())
            .cloned();

        let mut table = lock(&self.categories);
        let key = (category.class_name.clone(), category.name.clone());
        if table.seen.contains(&key) {
            return Err(Error::DuplicateRegistration {
                name: category.label(),
            });
        }

        match target {
            Some(class) => {
                self.merge_category(&class, &category)?;
                table.seen.insert(key);
                Ok(true)
            }
            None => {
                oxifw_log::debug!("category {} pending until its class links", category.label());
                table.seen.insert(key);
                table.pending.push(category);
                Ok(false)
            }
        }
    }

    /// Registers a category, treating failure as fatal.
    pub fn register_category(&self, category: CategoryDescriptor) -> bool {
        self.try_register_category(category).or_fatal()
    }

    /// Merges pending categories whose class is now linked. Returns how many
    /// were merged.
    ///
    /// A category that fails to merge is discarded and its name freed, so a
    /// corrected version can be registered again.
    ///
    /// # Errors
    ///
    /// Returns the first merge error after attempting every ready category.
    pub(crate) fn merge_pending_categories(&self) -> Result<usize> {
        let ready: Vec<(Class, CategoryDescriptor)> = {
            let classes = read_lock(&self.classes);
            let mut table = lock(&self.categories);
            let (ready, waiting): (Vec<_>, Vec<_>) =
                std::mem::take(&mut table.pending).into_iter().partition(|cat| {
                    classes
                        .get(cat.class_name.as_str())
                        .is_some_and(Class::is_linked)
                });
            table.pending = waiting;
            ready
                .into_iter()
                .filter_map(|cat| {
                    let class = classes.get(cat.class_name.as_str()).cloned()?;
                    Some((class, cat))
                })
                .collect()
        };

        let mut merged = 0;
        let mut first_error = None;
        for (class, category) in &ready {
            match self.merge_category(class, category) {
                Ok(()) => merged += 1,
                Err(err) => {
                    oxifw_log::debug!("failed to merge category {}: {err}", category.label());
                    lock(&self.categories)
                        .seen
                        .remove(&(category.class_name.clone(), category.name.clone()));
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(merged),
        }
    }

    fn merge_category(&self, class: &Class, category: &CategoryDescriptor) -> Result<()> {
        let protocols = self.resolve_protocols(&category.label(), &category.protocols)?;
        let metaclass = class.metaclass().ok_or_else(|| class.not_linked())?;

        for method in &category.instance_methods {
            class.put_method(method.clone());
        }
        for method in &category.class_methods {
            metaclass.put_method(method.clone());
        }
        class.add_protocols(&protocols);

        self.invalidate(class);
        if !category.class_methods.is_empty() {
            self.invalidate(&metaclass);
        }
        oxifw_log::debug!(
            "merged category {}: {} instance, {} class method(s)",
            category.label(),
            category.instance_methods.len(),
            category.class_methods.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::class::ClassDescriptor;
    use crate::runtime::dispatch::Value;
    use crate::runtime::object::Object;
    use crate::runtime::protocol::ProtocolDescriptor;
    use crate::runtime::selector::Selector;

    fn one(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
        Value::Int(1)
    }

    fn two(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
        Value::Int(2)
    }

    #[test]
    fn test_merge_into_linked_class_overwrites() {
        let rt = Runtime::new();
        let class = rt.register_class(ClassDescriptor::root("Widget").method(Method::new("size", one)));
        rt.link();
        let sel = Selector::intern("size");
        assert!(std::ptr::fn_addr_eq(class.lookup(sel).unwrap(), one as crate::Imp));

        let merged = rt.register_category(
            CategoryDescriptor::new("Big", "Widget")
                .method(Method::new("size", two))
                .method(Method::new("extra", one)),
        );
        assert!(merged);
        assert!(std::ptr::fn_addr_eq(class.lookup(sel).unwrap(), two as crate::Imp));
        assert!(class.responds_to(Selector::intern("extra")));
    }

    #[test]
    fn test_pending_until_linked() {
        let rt = Runtime::new();
        let merged = rt.register_category(
            CategoryDescriptor::new("Later", "Future").class_method(Method::new("make", one)),
        );
        assert!(!merged);

        let class = rt.register_class(ClassDescriptor::root("Future"));
        rt.link();
        let meta = class.metaclass().unwrap();
        assert!(meta.responds_to(Selector::intern("make")));
        assert!(!class.responds_to(Selector::intern("make")));
    }

    #[test]
    fn test_duplicate_category_name() {
        let rt = Runtime::new();
        rt.register_category(CategoryDescriptor::new("Twice", "Anything"));
        assert_eq!(
            rt.try_register_category(CategoryDescriptor::new("Twice", "Anything")).unwrap_err(),
            Error::DuplicateRegistration { name: "Anything(Twice)".into() }
        );
        // Same category name on another class is fine.
        assert!(rt.try_register_category(CategoryDescriptor::new("Twice", "Other")).is_ok());
    }

    #[test]
    fn test_category_adds_protocol() {
        let rt = Runtime::new();
        let proto = rt.register_protocol(ProtocolDescriptor::new("Sized").requires("size"));
        let class = rt.register_class(ClassDescriptor::root("Box"));
        rt.link();
        assert!(!class.conforms_to(&proto));

        rt.register_category(
            CategoryDescriptor::new("Sizing", "Box")
                .adopts("Sized")
                .method(Method::new("size", one)),
        );
        assert!(class.conforms_to(&proto));
        assert!(rt.validate_conformance(&class, &proto).is_ok());
    }
}
