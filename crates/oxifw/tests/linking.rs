//! Registration, linking, categories and instance lifecycle.

mod common;

use common::{animal_runtime, new_instance, say, sel, speak_woof};
use oxifw::{
    CategoryDescriptor, ClassDescriptor, ClassFlags, Error, Method, Module, Object,
    ProtocolDescriptor, Runtime,
};
use std::sync::Mutex;

const PTR: usize = std::mem::size_of::<usize>();

#[test]
fn test_instance_sizes_accumulate_down_the_hierarchy() {
    let rt = Runtime::new();
    rt.load(
        Module::new()
            .class(ClassDescriptor::root("Base").ivar("id", "q"))
            .class(ClassDescriptor::subclass("Mid", "Base").ivar("flag", "c").ivar("count", "i"))
            .class(ClassDescriptor::subclass("Leaf", "Mid")),
    );

    let base = rt.get_class("Base");
    let mid = rt.get_class("Mid");
    let leaf = rt.get_class("Leaf");
    assert_eq!(base.instance_size(), Some(PTR + 8));
    assert_eq!(mid.ivar("flag").unwrap().offset, PTR + 8);
    assert_eq!(mid.ivar("count").unwrap().offset, PTR + 12);
    assert_eq!(mid.instance_size(), Some(PTR + 16));
    assert_eq!(leaf.instance_size(), mid.instance_size());
    assert!(leaf.ivars().is_empty());
}

#[test]
fn test_link_flags_and_names() {
    let rt = animal_runtime();
    let dog = rt.get_class("Dog");
    assert!(dog.flags().contains(ClassFlags::REGISTERED | ClassFlags::LINKED));
    assert!(!dog.is_metaclass());
    assert_eq!(rt.class_names(), vec!["Animal", "Dog", "Puppy"]);
    assert_eq!(
        rt.try_get_class("Cat").unwrap_err(),
        Error::ClassNotFound { name: "Cat".into() }
    );
}

#[test]
fn test_inheritance_cycle_leaves_classes_unlinked() {
    let rt = Runtime::new();
    let err = rt
        .try_load(
            Module::new()
                .class(ClassDescriptor::subclass("Chicken", "Egg"))
                .class(ClassDescriptor::subclass("Egg", "Chicken")),
        )
        .unwrap_err();
    assert!(matches!(err, Error::MalformedHierarchy { .. }));
    assert!(matches!(
        Object::try_allocate(&rt.get_class("Egg")),
        Err(Error::NotLinked { .. })
    ));
}

#[test]
fn test_conflicting_registration_is_duplicate() {
    let rt = animal_runtime();
    let err = rt
        .try_register_class(ClassDescriptor::subclass("Dog", "Puppy"))
        .unwrap_err();
    assert_eq!(err, Error::DuplicateRegistration { name: "Dog".into() });
}

#[test]
fn test_category_overrides_and_extends() {
    let rt = animal_runtime();
    rt.register_category(
        CategoryDescriptor::new("Loud", "Animal")
            .method(Method::new("speak", speak_woof))
            .method(Method::new("wag", speak_woof)),
    );

    assert_eq!(say(&rt, &new_instance(&rt, "Animal")), "Woof");
    let puppy = new_instance(&rt, "Puppy");
    assert!(puppy.responds_to(sel("wag")));
}

#[test]
fn test_category_waits_for_its_class() {
    let rt = Runtime::new();
    assert!(!rt.register_category(
        CategoryDescriptor::new("Tricks", "Parrot").method(Method::new("talk", speak_woof))
    ));
    rt.load(Module::new().class(ClassDescriptor::root("Parrot")));

    let parrot = new_instance(&rt, "Parrot");
    assert_eq!(rt.send_as::<String>(Some(&parrot), sel("talk"), &[]), "Woof");
}

static TEARDOWN: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

fn teardown_vehicle(_: &Object) {
    TEARDOWN.lock().unwrap().push("Vehicle");
}

fn teardown_car(obj: &Object) {
    assert_eq!(obj.get_ivar::<u32>("doors").unwrap(), 4);
    TEARDOWN.lock().unwrap().push("Car");
}

#[test]
fn test_destructors_run_most_derived_first() {
    let rt = Runtime::new();
    rt.load(
        Module::new()
            .class(ClassDescriptor::root("Vehicle").ivar("wheels", "I").destructor(teardown_vehicle))
            .class(
                ClassDescriptor::subclass("Car", "Vehicle")
                    .ivar("doors", "I")
                    .destructor(teardown_car),
            )
            .class(ClassDescriptor::subclass("Coupe", "Car")),
    );

    let coupe = new_instance(&rt, "Coupe");
    coupe.set_ivar("doors", 4u32).unwrap();
    let extra = coupe.clone();
    drop(coupe);
    assert!(TEARDOWN.lock().unwrap().is_empty());

    drop(extra);
    assert_eq!(*TEARDOWN.lock().unwrap(), vec!["Car", "Vehicle"]);
}

#[test]
fn test_typed_ivars_check_encoding() {
    let rt = animal_runtime();
    let dog = new_instance(&rt, "Dog");
    dog.set_ivar("legs", 4i32).unwrap();
    assert_eq!(dog.get_ivar::<i32>("legs").unwrap(), 4);
    assert!(matches!(
        dog.get_ivar::<f64>("legs"),
        Err(Error::IvarTypeMismatch { .. })
    ));
    assert!(matches!(
        dog.set_ivar("tail", 1i32),
        Err(Error::IvarNotFound { .. })
    ));
}

#[test]
fn test_object_ivars_retain() {
    let rt = Runtime::new();
    rt.load(Module::new().class(ClassDescriptor::root("Node").ivar("next", "@")));
    let head = new_instance(&rt, "Node");
    let tail = new_instance(&rt, "Node");

    head.set_object_ivar("next", Some(tail.clone())).unwrap();
    assert_eq!(tail.retain_count(), 2);
    head.set_object_ivar("next", None).unwrap();
    assert_eq!(tail.retain_count(), 1);
}

#[test]
fn test_pending_category_with_unknown_protocol_fails_link() {
    let rt = Runtime::new();
    let broken = CategoryDescriptor::new("Extras", "Later")
        .method(Method::new("extra", speak_woof))
        .adopts("Missing");
    assert!(!rt.register_category(broken));
    rt.register_class(ClassDescriptor::root("Later"));

    let err = rt.try_link().unwrap_err();
    assert!(matches!(err, Error::MalformedHierarchy { ref name, .. } if name == "Later(Extras)"));
    let later = rt.get_class("Later");
    assert!(later.is_linked());
    assert!(!later.responds_to(sel("extra")));

    // The failed category's name is free again.
    rt.register_protocol(ProtocolDescriptor::new("Missing"));
    let fixed = CategoryDescriptor::new("Extras", "Later")
        .method(Method::new("extra", speak_woof))
        .adopts("Missing");
    assert_eq!(rt.try_register_category(fixed), Ok(true));
    assert!(later.responds_to(sel("extra")));
}

#[test]
fn test_failed_pending_category_does_not_block_others() {
    let rt = Runtime::new();
    rt.register_category(CategoryDescriptor::new("Bad", "Host").adopts("Nowhere"));
    rt.register_category(
        CategoryDescriptor::new("Good", "Host").method(Method::new("extra", speak_woof)),
    );
    rt.register_class(ClassDescriptor::root("Host"));

    assert!(rt.try_link().is_err());
    assert!(rt.get_class("Host").responds_to(sel("extra")));
}
