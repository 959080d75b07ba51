use rand::RngCore;


#[cfg_attr(test, mockall::automock)]
pub trait Random: Send + Sync {
    fn next_u32(&self) -> u32;
}
pub struct RngRandom {}
impl Random for RngRandom {
    fn next_u32(&self) -> u32 {
        rand::rng().next_u32()
    }
}
