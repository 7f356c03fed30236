//! Interactive chat shell.
//! Run with: cargo run --bin chatbot [conversation_id]

use std::process::ExitCode;

use chatbot::start_chatbot;

fn main() -> ExitCode {
    start_chatbot::run_shell()
}
