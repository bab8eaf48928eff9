pub mod balancer;
pub mod client;
pub mod middleware;
pub mod orchestrator;

pub use balancer::{BalancingClient, BalancingStrategy, RoundRobin};
pub use client::{
    Bound, ClientOptions, HttpClient, OutboundRequest, ReqwestClient, TransportError,
    UpstreamResponse, default_client,
};
pub use middleware::{Balancer, BalancerConfig, BalancerForward, DomainForward, Forward};
pub use orchestrator::{
    Proxy, ProxyOptions, RequestHook, ResponseHook, do_deadline, do_redirects, do_request,
    do_timeout,
};
