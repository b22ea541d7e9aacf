//! Bundled test modules. Each corresponds to one `tests/*.py` file in the
//! original, registered under its YAML section name in `ext_cmd::registry`.

pub mod netpol_cross_ns;
