pub mod fifo;

pub struct HasSplit<A: Sized> {
    pub(crate) take: A,
    pub(crate) leave: A, // non-maybe.  consequence of split.
}
