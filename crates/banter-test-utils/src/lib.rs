// banter-test-utils: Shared test utilities for the hub service.
//
// Provides a mock websocket client that speaks the hub's frame protocol,
// for integration tests that drive a real listener.

pub mod mock_ws_client;

pub use mock_ws_client::{MockWsClient, Received};
