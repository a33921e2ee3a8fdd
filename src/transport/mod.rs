// Transport abstraction: the HTTP client the coalescing layer drives, plus a reqwest binding.

pub mod http;
pub mod traits;
