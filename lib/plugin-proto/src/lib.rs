//! Generated types for the plugin RPC protocol spoken between a plugin
//! process and its host agent.

pub mod pluginrpc {
    tonic::include_proto!("pluginrpc");
}
