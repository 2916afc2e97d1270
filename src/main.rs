use itertools::Itertools;

mod device;
mod pipeline;
mod sink;
mod soc;
mod source;
mod usb;

const TOP_LEVEL_SUBCOMMANDS: [&str; 5] = [
    "script",
    "soc",
    "usb::byte",
    "usb::packet",
    "usb::protocol",
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let mut pipeline = Vec::new();

    for (sub_command, args) in std::env::args().skip(1).peekable().batching(|it| {
        it.next().map(|subcmd| {
            let mut args = it
                .peeking_take_while(|s| !TOP_LEVEL_SUBCOMMANDS.contains(&s.as_str()))
                .collect::<Vec<_>>();

            if it.len() == 0 {
                args.push("-v".into());
            }
            (subcmd, args)
        })
    }) {
        match sub_command.as_str() {
            "script" => source::script::build(&mut pipeline, &args),
            "soc" => soc::build(&mut pipeline, &args),
            "usb::byte" => usb::byte::build(&mut pipeline, &args),
            "usb::packet" => usb::packet::build(&mut pipeline, &args),
            "usb::protocol" => usb::protocol::build(&mut pipeline, &args),
            other => {
                eprintln!(
                    "Unknown stage {:?}, expected one of {}",
                    other,
                    TOP_LEVEL_SUBCOMMANDS.join(", ")
                );
                std::process::exit(1);
            }
        }
    }

    colored::control::set_override(true);
    if pipeline.len() != 1 {
        return Err("The pipeline should resolve to a single iterator".into());
    }
    if let Some(event_iterator) = pipeline.pop() {
        event_iterator.for_each(|_| {});
    }

    Ok(())
}
