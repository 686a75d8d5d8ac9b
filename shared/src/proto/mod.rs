//! Generated wire types, pulled in from `OUT_DIR` (see `build.rs`).
//!
//! Kept as thin `include!` shims rather than checked-in generated sources:
//! there is no cross-compilation boundary here that would make committing
//! the generated code worthwhile.

pub mod descriptor {
    include!(concat!(env!("OUT_DIR"), "/diskarbd.descriptor.rs"));
}

pub mod callback {
    include!(concat!(env!("OUT_DIR"), "/diskarbd.callback.rs"));
}

pub mod request {
    include!(concat!(env!("OUT_DIR"), "/diskarbd.request.rs"));
}

pub mod rpc {
    include!(concat!(env!("OUT_DIR"), "/diskarbd.rpc.rs"));
}
