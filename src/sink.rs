use std::any::TypeId;

use colored::*;

use crate::pipeline::{Event, EventIterator};

/// Passes events through, printing each one on the way.
struct PrintSink {
    it: Box<dyn Iterator<Item = Event>>,
    event_type: TypeId,
    event_type_name: &'static str,
}

impl Iterator for PrintSink {
    type Item = Event;
    fn next(&mut self) -> Option<Self::Item> {
        let (ts, res) = self.it.next()?;
        match &res {
            Ok(event) => println!("{:.9}: {:?}", ts, event.as_debug()),
            Err(e) => println!("{:.9}: {} {:#}", ts, "Error".red().bold(), e),
        }
        Some((ts, res))
    }
}

impl EventIterator for PrintSink {
    fn into_iterator(self: Box<Self>) -> Box<dyn Iterator<Item = Event>> {
        self
    }
    fn event_type(&self) -> TypeId {
        self.event_type
    }
    fn event_type_name(&self) -> &'static str {
        self.event_type_name
    }
}

/// Wraps `node` so its events get printed when `verbose` is set.
pub fn verbose(node: Box<dyn EventIterator>, verbose: bool) -> Box<dyn EventIterator> {
    if !verbose {
        return node;
    }
    let event_type = node.event_type();
    let event_type_name = node.event_type_name();
    Box::new(PrintSink {
        it: node.into_iterator(),
        event_type,
        event_type_name,
    })
}
