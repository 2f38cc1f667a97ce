//! End-to-end message dispatch.

mod common;

use common::{animal_runtime, new_instance, say, sel, speak_generic};
use oxifw::{ClassDescriptor, Error, Imp, Method, Object, Runtime, Selector, Value};
use std::sync::Mutex;

#[test]
fn test_dog_says_woof() {
    let rt = animal_runtime();
    let animal = new_instance(&rt, "Animal");
    let dog = new_instance(&rt, "Dog");

    assert_eq!(say(&rt, &animal), "...");
    assert_eq!(say(&rt, &dog), "Woof");
}

#[test]
fn test_override_is_inherited_by_grandchild() {
    let rt = animal_runtime();
    let puppy = new_instance(&rt, "Puppy");
    assert_eq!(say(&rt, &puppy), "Woof");
    assert!(puppy.is_kind_of(&rt.get_class("Animal")));
    assert!(!new_instance(&rt, "Animal").is_kind_of(&rt.get_class("Dog")));
}

#[test]
fn test_nil_receiver() {
    let rt = animal_runtime();
    let dog = rt.get_class("Dog");

    assert_eq!(rt.send(None, sel("speak"), &[]), Value::Nil);
    assert_eq!(rt.send_as::<i64>(None, sel("count"), &[]), 0);
    assert!(!rt.send_as::<bool>(None, sel("isEmpty"), &[]));
    assert_eq!(rt.send_super(None, &dog, sel("speak"), &[]), Value::Nil);
    assert_eq!(dog.dtable_builds(), 0);
}

#[test]
#[should_panic(expected = "Dog does not understand 'fly'")]
fn test_unknown_selector_is_fatal() {
    let rt = animal_runtime();
    let dog = new_instance(&rt, "Dog");
    rt.send(Some(&dog), sel("fly"), &[]);
}

#[test]
fn test_try_send_reports_does_not_understand() {
    let rt = animal_runtime();
    let dog = new_instance(&rt, "Dog");
    assert_eq!(
        rt.try_send(Some(&dog), sel("fly"), &[]).unwrap_err(),
        Error::DoesNotUnderstand {
            class: "Dog".into(),
            selector: "fly".into()
        }
    );
}

fn shout(rt: &Runtime, receiver: &Object, sel: Selector, args: &[Value]) -> Value {
    let dog = rt.get_class("Dog");
    let said: String = rt.send_as(Some(receiver), Selector::intern("speak"), args);
    let generic = rt.send_super(Some(receiver), &dog, Selector::intern("speak"), args);
    Value::from(format!("{said} then {} via {sel}", generic.as_str().unwrap_or("?")))
}

#[test]
fn test_send_super_starts_above_given_class() {
    let rt = animal_runtime();
    let dog_class = rt.get_class("Dog");
    rt.replace_method(&dog_class, sel("shout"), shout, None);

    let puppy = new_instance(&rt, "Puppy");
    let got = rt.send(Some(&puppy), sel("shout"), &[]);
    assert_eq!(got.as_str(), Some("Woof then ... via shout"));

    let imp = rt.msg_lookup_super(Some(&puppy), &dog_class, sel("speak"));
    assert!(std::ptr::fn_addr_eq(imp, speak_generic as Imp));
}

#[test]
fn test_send_super_from_root_forwards() {
    let rt = animal_runtime();
    let animal = rt.get_class("Animal");
    let obj = new_instance(&rt, "Animal");
    assert!(matches!(
        rt.try_send_super(Some(&obj), &animal, sel("speak"), &[]),
        Err(Error::DoesNotUnderstand { .. })
    ));
}

fn forwarded(_: &Runtime, _: &Object, sel: Selector, args: &[Value]) -> Value {
    Value::from(format!("forwarded {sel} with {} arg(s)", args.len()))
}

#[test]
fn test_forwarding_handler_supplies_implementation() {
    let rt = animal_runtime();
    let dog = new_instance(&rt, "Dog");
    rt.set_forwarding_handler(|receiver, sel| {
        (receiver.class_name() == "Dog" && sel.name() == "fetch:").then_some(forwarded as Imp)
    });

    let got = rt.send(Some(&dog), sel("fetch:"), &[Value::from("ball")]);
    assert_eq!(got.as_str(), Some("forwarded fetch: with 1 arg(s)"));
    assert!(!dog.responds_to(sel("fetch:")));

    let cat = new_instance(&rt, "Animal");
    assert!(rt.try_send(Some(&cat), sel("fetch:"), &[]).is_err());
}

#[test]
fn test_last_installed_handler_wins() {
    fn first(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
        Value::Int(1)
    }
    fn second(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
        Value::Int(2)
    }

    let rt = animal_runtime();
    let dog = new_instance(&rt, "Dog");
    rt.set_forwarding_handler(|_, _| Some(first as Imp));
    rt.set_forwarding_handler(|_, _| Some(second as Imp));
    assert_eq!(rt.send_as::<i64>(Some(&dog), sel("anything"), &[]), 2);
}

fn make(_: &Runtime, receiver: &Object, _: Selector, _: &[Value]) -> Value {
    receiver
        .as_class()
        .map_or(Value::Nil, |class| Value::Object(Object::allocate(&class)))
}

#[test]
fn test_class_methods_dispatch_through_metaclass() {
    let rt = Runtime::new();
    rt.register_class(
        ClassDescriptor::root("Shape").class_method(Method::new("make", make).with_types("@@:")),
    );
    rt.register_class(ClassDescriptor::subclass("Circle", "Shape"));
    rt.link();

    let circle = rt.get_class("Circle");
    let made: Option<Object> = rt.send_as(Some(&circle.class_object().unwrap()), sel("make"), &[]);
    let made = made.unwrap();
    assert_eq!(made.class(), &circle);

    // Instances do not see class methods.
    assert!(rt.try_send(Some(&made), sel("make"), &[]).is_err());
}

#[test]
fn test_root_instance_methods_answer_class_messages() {
    let rt = animal_runtime();
    let dog = rt.get_class("Dog");
    let got = rt.send_class(&dog, sel("self"), &[]);
    let object = got.as_object().unwrap();
    assert_eq!(object.as_class(), Some(dog));
}

static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

fn init_base(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
    ORDER.lock().unwrap().push("InitOrderBase");
    Value::Nil
}

fn init_derived(rt: &Runtime, receiver: &Object, _: Selector, _: &[Value]) -> Value {
    // Messaging the class being initialized does not re-run +initialize.
    rt.send(Some(receiver), Selector::intern("touch"), &[]);
    ORDER.lock().unwrap().push("InitOrderDerived");
    Value::Nil
}

#[test]
fn test_initialize_superclass_first_and_once() {
    let rt = Runtime::new();
    rt.register_class(
        ClassDescriptor::root("InitOrderBase")
            .class_method(Method::new("initialize", init_base))
            .class_method(Method::new("touch", common::return_nil)),
    );
    rt.register_class(
        ClassDescriptor::subclass("InitOrderDerived", "InitOrderBase")
            .class_method(Method::new("initialize", init_derived)),
    );
    rt.link();

    let derived = rt.get_class("InitOrderDerived");
    rt.send_class(&derived, sel("touch"), &[]);
    rt.send_class(&derived, sel("touch"), &[]);

    assert_eq!(*ORDER.lock().unwrap(), vec!["InitOrderBase", "InitOrderDerived"]);
    assert!(derived.is_initialized());
}
