//! Integration tests: the record server over HTTP, the orchestrator's drain
//! guarantees and full client sessions.

mod server;
