//! Chatbot HTTP server.
//! Run with: cargo run --bin chatbot-server

use std::process::ExitCode;

use chatbot::start_chatbot;

fn main() -> ExitCode {
    start_chatbot::run_server()
}
