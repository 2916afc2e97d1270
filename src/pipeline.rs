use std::any::{Any, TypeId};
use std::fmt::Debug;

use anyhow::Result;
use colored::*;

pub trait EventData: Debug + Any {
    fn as_debug(&self) -> &dyn Debug;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
impl<T: Debug + Any> EventData for T {
    fn as_debug(&self) -> &dyn Debug {
        self
    }
    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// A stage wired to the wrong upstream is a command line mistake: report it and leave.
pub fn downcast<T: 'static>(event: Box<dyn EventData>) -> Box<T> {
    let name = event.type_name();
    event.into_any().downcast::<T>().unwrap_or_else(|_| {
        eprintln!(
            "{} Unexpected event type {} while expecting {}",
            "Error".red().bold(),
            name,
            std::any::type_name::<T>()
        );
        std::process::exit(1);
    })
}

/// Timestamp in seconds of simulated time and the event or the error met while producing it.
pub type Event = (f64, Result<Box<dyn EventData>>);

pub trait EventIterator: Iterator<Item = Event> {
    fn into_iterator(self: Box<Self>) -> Box<dyn Iterator<Item = Event>>;
    fn event_type(&self) -> TypeId;
    fn event_type_name(&self) -> &'static str;
}

pub type Pipeline = Vec<Box<dyn EventIterator>>;
pub type Builder = fn(&mut Pipeline, &[String]);

/// Inserts the default `upstream` stage unless the last stage already produces `T`.
pub fn ensure_upstream<T: 'static>(pipeline: &mut Pipeline, upstream: Builder) {
    if pipeline
        .last()
        .map(|node| node.event_type() != TypeId::of::<T>())
        .unwrap_or(true)
    {
        upstream(pipeline, &[]);
    }
}

/// Pops the last stage, to be consumed by the stage being built.
pub fn take_upstream(pipeline: &mut Pipeline, stage: &str) -> Box<dyn Iterator<Item = Event>> {
    match pipeline.pop() {
        Some(node) => node.into_iterator(),
        None => {
            eprintln!("{} Missing source for {}", "Error".red().bold(), stage);
            std::process::exit(1);
        }
    }
}
