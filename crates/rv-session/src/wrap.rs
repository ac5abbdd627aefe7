//! Wrapping of the program body for remote evaluation
//!
//! The body is evaluated as a single request. Its forms are handed to
//! `load-string` so they are read and compiled one at a time, exactly as if
//! the file had been loaded, while the surrounding `binding` supplies the
//! program arguments and, when the multiplexer is active, rebinds the
//! standard streams to the run's named pipes.

use rv_core::{string_literal, Form};

use crate::multiplexer::Channels;

/// Build the code submitted for the program body
pub fn wrap_body(forms: &[Form], args: &[String], channels: Option<&Channels>) -> String {
    let source = forms
        .iter()
        .map(Form::as_str)
        .collect::<Vec<_>>()
        .join("\n");
    let load = format!("(load-string {})", string_literal(&source));

    let mut bindings = Vec::new();
    if let Some(channels) = channels {
        bindings.extend(channel_bindings(channels));
    }
    bindings.push(format!("*command-line-args* {}", args_list(args)));

    let body = match channels {
        Some(channels) => format!(
            "(try {} (finally {}))",
            load,
            end_of_stream(&channels.marker)
        ),
        None => load,
    };

    format!("(binding [{}] {})", bindings.join("\n          "), body)
}

/// Quoted argument list, or `nil` when there are none
pub fn args_list(args: &[String]) -> String {
    if args.is_empty() {
        return "nil".to_string();
    }

    let quoted: Vec<String> = args.iter().map(|arg| string_literal(arg)).collect();
    format!("(list {})", quoted.join(" "))
}

fn channel_bindings(channels: &Channels) -> [String; 3] {
    let path = |p: &std::path::Path| string_literal(&p.to_string_lossy());

    [
        format!(
            "*in* (clojure.lang.LineNumberingPushbackReader. (clojure.java.io/reader {}))",
            path(&channels.input)
        ),
        format!("*out* (clojure.java.io/writer {})", path(&channels.output)),
        format!(
            "*err* (java.io.PrintWriter. (clojure.java.io/writer {}) true)",
            path(&channels.error)
        ),
    ]
}

/// Write the marker to both output streams and close them
fn end_of_stream(marker: &str) -> String {
    let marker = string_literal(marker);
    ["*out*", "*err*"]
        .iter()
        .map(|stream| {
            format!(
                "(.write {s} {m}) (.flush {s}) (.close {s})",
                s = stream,
                m = marker
            )
        })
        .collect::<Vec<_>>()
        .join(" ")
}
