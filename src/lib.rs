pub mod calibration;
pub mod clock;
pub mod config;
pub mod jog;
pub mod messages;
pub mod motor;
pub mod procedure;
pub mod sampler;

#[cfg(test)]
mod test_support;
