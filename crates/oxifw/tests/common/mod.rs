// Shared fixtures for the integration tests.

#![allow(dead_code)]

use oxifw::{ClassDescriptor, Method, Module, Object, Runtime, Selector, Value};

pub fn speak_generic(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
    Value::from("...")
}

pub fn speak_woof(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
    Value::from("Woof")
}

pub fn return_nil(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
    Value::Nil
}

pub fn return_self(_: &Runtime, receiver: &Object, _: Selector, _: &[Value]) -> Value {
    Value::Object(receiver.clone())
}

/// Animal <- Dog <- Puppy, with `speak` on Animal and Dog and a `legs` ivar.
pub fn animal_runtime() -> Runtime {
    let rt = Runtime::new();
    rt.load(
        Module::new()
            .class(
                ClassDescriptor::root("Animal")
                    .ivar("legs", "i")
                    .method(Method::new("speak", speak_generic).with_types("@@:"))
                    .method(Method::new("self", return_self).with_types("@@:")),
            )
            .class(
                ClassDescriptor::subclass("Dog", "Animal")
                    .method(Method::new("speak", speak_woof).with_types("@@:")),
            )
            .class(ClassDescriptor::subclass("Puppy", "Dog")),
    );
    rt
}

pub fn new_instance(rt: &Runtime, class: &str) -> Object {
    Object::allocate(&rt.get_class(class))
}

pub fn sel(name: &str) -> Selector {
    Selector::intern(name)
}

pub fn say(rt: &Runtime, receiver: &Object) -> String {
    rt.send_as(Some(receiver), sel("speak"), &[])
}
