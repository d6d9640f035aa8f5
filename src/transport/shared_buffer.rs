use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;


/// A fixed-length byte buffer shared between the application's tick thread and a link's
///  background receive loop.
///
/// Every access is a short copy in or copy out, so readers see the result of one complete
///  transfer (last write wins). There is no snapshotting across several reads, and a buffer's
///  length never changes after construction.
#[derive(Clone)]
pub struct SharedBuffer {
    buf: Arc<Mutex<BytesMut>>,
}
impl SharedBuffer {
    pub fn new(len: usize) -> SharedBuffer {
        SharedBuffer::from_slice(&vec![0u8; len])
    }

    pub fn from_slice(data: &[u8]) -> SharedBuffer {
        SharedBuffer {
            buf: Arc::new(Mutex::new(BytesMut::from(data))),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// overwrite the buffer's prefix with `data`, leaving the rest unchanged. Data exceeding the
    ///  buffer length is ignored. Returns the number of bytes written.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut buf = self.lock();
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        n
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.lock().to_vec()
    }

    /// copy the buffer's contents into `target`, returning the number of bytes copied
    pub fn copy_to(&self, target: &mut [u8]) -> usize {
        let buf = self.lock();
        let n = target.len().min(buf.len());
        target[..n].copy_from_slice(&buf[..n]);
        n
    }

    /// checks if two handles refer to the same underlying memory
    pub fn is_same(&self, other: &SharedBuffer) -> bool {
        Arc::ptr_eq(&self.buf, &other.buf)
    }

    fn lock(&self) -> MutexGuard<'_, BytesMut> {
        // NB: a panic while holding the lock can not leave the bytes in an invalid state
        self.buf.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
impl Debug for SharedBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedBuffer{{len:{}}}", self.len())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::exact(vec![1,2,3,4], vec![9,8,7,6], vec![9,8,7,6], 4)]
    #[case::prefix(vec![1,2,3,4], vec![9,8], vec![9,8,3,4], 2)]
    #[case::too_long(vec![1,2], vec![9,8,7], vec![9,8], 2)]
    #[case::empty_data(vec![1,2], vec![], vec![1,2], 0)]
    fn test_write(#[case] initial: Vec<u8>, #[case] data: Vec<u8>, #[case] expected: Vec<u8>, #[case] expected_written: usize) {
        let buf = SharedBuffer::from_slice(&initial);
        assert_eq!(buf.write(&data), expected_written);
        assert_eq!(buf.to_vec(), expected);
        assert_eq!(buf.len(), initial.len());
    }

    #[test]
    fn test_clones_share_memory() {
        let a = SharedBuffer::new(3);
        let b = a.clone();
        b.write(&[5, 6, 7]);
        assert_eq!(a.to_vec(), vec![5, 6, 7]);
        assert!(a.is_same(&b));
        assert!(!a.is_same(&SharedBuffer::new(3)));
    }

    #[test]
    fn test_copy_to() {
        let buf = SharedBuffer::from_slice(&[1, 2, 3]);
        let mut target = [0u8; 2];
        assert_eq!(buf.copy_to(&mut target), 2);
        assert_eq!(target, [1, 2]);
    }
}
