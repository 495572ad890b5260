/*
  ____                 __               __   _ __
 / __ \__ _____ ____  / /___ ____ _    / /  (_) /
/ /_/ / // / _ `/ _ \/ __/ // /  ' \  / /__/ / _ \
\___\_\_,_/\_,_/_//_/\__/\_,_/_/_/_/ /____/_/_.__/
    Part of the Quantum OS Project

Copyright 2025 Gavin Kellam

Permission is hereby granted, free of charge, to any person obtaining a copy of this software and
associated documentation files (the "Software"), to deal in the Software without restriction,
including without limitation the rights to use, copy, modify, merge, publish, distribute,
sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:

The above copyright notice and this permission notice shall be included in all copies or substantial
portions of the Software.

THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT
NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM,
DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT
OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.
*/

//! Kernel logging.
//!
//! Each macro invocation is one record: every line of it is prefixed with a
//! severity tag and the emitting module, so interleaved output from
//! different subsystems stays attributable. Records reach the outside world
//! through a single attached output function; with none attached (or with
//! the sink busy mid-panic) output is dropped rather than blocking.

#![no_std]

use core::fmt::Write;

pub mod color;

use color::{ERROR_STYLE, LOG_STYLE, ORIGIN_STYLE, RESET, WARN_STYLE};

/// Which kind of message is being emitted. Picks the line tag and its
/// style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Log,
    Warn,
    Error,
}

impl LogKind {
    fn tag(&self) -> &'static str {
        match self {
            LogKind::Log => " log",
            LogKind::Warn => "warn",
            LogKind::Error => "err!",
        }
    }

    fn style(&self) -> color::Style {
        match self {
            LogKind::Log => LOG_STYLE,
            LogKind::Warn => WARN_STYLE,
            LogKind::Error => ERROR_STYLE,
        }
    }
}

pub type OutputFn = fn(core::fmt::Arguments);

static OUTPUT: spin::Mutex<Option<OutputFn>> = spin::Mutex::new(None);

/// Push already-rendered text at the attached sink. A busy sink (say, a
/// panic while someone was printing) drops the text instead of spinning.
fn emit(args: core::fmt::Arguments) {
    let Some(output) = OUTPUT.try_lock() else {
        return;
    };

    if let Some(sink) = *output {
        sink(args);
    }
}

/// Attach the function that carries log output to the outside world (serial
/// port, host stdout, ...).
pub fn set_global_debug_fn(function: OutputFn) {
    *OUTPUT.lock() = Some(function);
}

/// Detach the output function; output is dropped until a new one is attached.
pub fn clear_global_debug_fn() {
    if let Some(mut output) = OUTPUT.try_lock() {
        *output = None;
    }
}

/// Renders one record. Tracks its own position, so a record carrying
/// embedded newlines gets every one of its lines tagged, while blank lines
/// pass through untouched.
struct RecordWriter<'a> {
    kind: LogKind,
    origin: &'a str,
    at_line_start: bool,
}

impl<'a> RecordWriter<'a> {
    fn new(kind: LogKind, origin: &'a str) -> Self {
        Self {
            kind,
            origin,
            at_line_start: true,
        }
    }

    fn finish_line(&mut self) {
        emit(format_args!("\n"));
        self.at_line_start = true;
    }
}

impl core::fmt::Write for RecordWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let mut rest = s;

        while !rest.is_empty() {
            if let Some(stripped) = rest.strip_prefix('\n') {
                self.finish_line();
                rest = stripped;
                continue;
            }

            if self.at_line_start {
                emit(format_args!(
                    "{}{}{} {}{}{}: ",
                    self.kind.style(),
                    self.kind.tag(),
                    RESET,
                    ORIGIN_STYLE,
                    self.origin,
                    RESET
                ));
                self.at_line_start = false;
            }

            let line_end = rest.find('\n').unwrap_or(rest.len());
            emit(format_args!("{}", &rest[..line_end]));
            rest = &rest[line_end..];
        }

        Ok(())
    }
}

#[doc(hidden)]
pub fn priv_print(kind: LogKind, origin: &str, args: core::fmt::Arguments) {
    let _ = RecordWriter::new(kind, origin).write_fmt(args);
}

#[doc(hidden)]
pub fn priv_println(kind: LogKind, origin: &str, args: core::fmt::Arguments) {
    let mut record = RecordWriter::new(kind, origin);
    let _ = record.write_fmt(args);
    record.finish_line();
}

/// Print a `log` message to the attached console.
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {{
        $crate::priv_print($crate::LogKind::Log, ::core::module_path!(), format_args!($($arg)*));
    }};
}

/// Print a `log` record to the attached console, newline terminated.
#[macro_export]
macro_rules! logln {
    () => {{ $crate::logln!("") }};
    ($($arg:tt)*) => {{
        $crate::priv_println($crate::LogKind::Log, ::core::module_path!(), format_args!($($arg)*));
    }};
}

/// Print a `warning` record to the attached console, newline terminated.
#[macro_export]
macro_rules! warnln {
    () => {{ $crate::warnln!("") }};
    ($($arg:tt)*) => {{
        $crate::priv_println($crate::LogKind::Warn, ::core::module_path!(), format_args!($($arg)*));
    }};
}

/// Print an `error` record to the attached console, newline terminated.
#[macro_export]
macro_rules! errorln {
    () => {{ $crate::errorln!("") }};
    ($($arg:tt)*) => {{
        $crate::priv_println($crate::LogKind::Error, ::core::module_path!(), format_args!($($arg)*));
    }};
}

/// Route log output to stdout, for unit tests only.
#[macro_export]
macro_rules! testing_stdout {
    () => {
        #[cfg(test)]
        {
            fn all_print(args: ::core::fmt::Arguments) {
                extern crate std;
                use std::io::Write;
                use std::io::stdout;
                let _ = stdout().write_fmt(args);
            }

            $crate::set_global_debug_fn(all_print);
        }
    };
}

#[cfg(test)]
mod test {
    use super::*;

    extern crate std;
    use std::string::String;
    use std::sync::Mutex as StdMutex;

    static CAPTURED: StdMutex<String> = StdMutex::new(String::new());

    fn capture(args: core::fmt::Arguments) {
        use core::fmt::Write;
        let _ = CAPTURED.lock().unwrap().write_fmt(args);
    }

    // One test, because the sink is process-global state.
    #[test]
    fn test_record_rendering() {
        set_global_debug_fn(capture);
        CAPTURED.lock().unwrap().clear();

        // Every line of a multi-line record carries the tag and origin;
        // blank lines pass through untagged.
        logln!("one\ntwo");
        logln!("above\n\nbelow");
        warnln!("careful");

        let output = CAPTURED.lock().unwrap().clone();

        assert_eq!(output.matches(" log").count(), 4);
        assert_eq!(output.matches("warn").count(), 1);
        assert_eq!(output.matches("loam::test").count(), 5);
        assert!(output.contains("one\n"));
        assert!(output.contains("two\n"));
        assert!(output.contains("above\n\n"));
        assert!(output.contains("careful\n"));

        // With the sink detached, output is dropped, not a hang.
        clear_global_debug_fn();
        errorln!("nobody hears this");
        assert!(!CAPTURED.lock().unwrap().contains("nobody"));
    }
}
