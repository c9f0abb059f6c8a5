//! Multi-node integration tests over loopback TCP with temporary ledgers.

mod test_utils;
