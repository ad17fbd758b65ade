#[cfg(test)] use std::sync::Mutex;


#[cfg(test)]
/// automock expectations for static methods are global - hold this lock to avoid races
pub static MOCK_RANDOM_MUTEX: Mutex<()> = Mutex::new(());

#[cfg_attr(test, mockall::automock)]
pub trait Random {
    /// a uniformly distributed value in `[0, 1)`
    fn gen_probability() -> f64;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_probability() -> f64 {
        rand::random::<f64>()
    }
}
