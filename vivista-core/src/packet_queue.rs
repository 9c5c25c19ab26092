//! # Packet Queue
//!
//! Byte-capped FIFO between the read loop and one stream decoder.
//!
//! Every flush bumps the queue's serial. Entries remember the serial they
//! were queued under, and everything downstream (decoded frames, clocks)
//! carries it too, so data from before a seek can be recognised and dropped.
//!
//! ```text
//!   put ──► [pkt s0][pkt s0][pkt s0] ──► get
//!
//!   flush_with_sentinel()
//!
//!   put ──► [FLUSH s1][pkt s1] ──► get     (decoder resets codec on FLUSH)
//! ```

use crate::cancel::Abortable;
use crate::media::{Packet, Serial};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("packet queue '{0}' aborted")]
pub struct QueueAborted(pub &'static str);

/// Shared read-only view of a queue's serial.
#[derive(Debug, Clone, Default)]
pub struct SerialHandle(Arc<AtomicU64>);

impl SerialHandle {
    pub fn get(&self) -> Serial {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) -> Serial {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Result of [`BoundedPacketQueue::get`].
#[derive(Debug)]
pub enum QueueGet {
    /// Non-blocking get on an empty queue.
    Empty,
    /// Queue aborted; the consumer should exit.
    Quit,
    Packet { packet: Packet, serial: Serial },
    /// Reset the codec and adopt `serial`.
    Flush { serial: Serial },
    /// No more packets until the next flush; drain the codec.
    EndOfStream { serial: Serial },
}

#[derive(Debug)]
enum Entry {
    Packet(Packet),
    Flush,
    EndOfStream,
}

#[derive(Debug)]
struct Node {
    entry: Entry,
    serial: Serial,
}

struct Inner {
    nodes: VecDeque<Node>,
    size: usize,
    aborted: bool,
}

pub struct BoundedPacketQueue {
    name: &'static str,
    inner: Mutex<Inner>,
    cond: Condvar,
    serial: SerialHandle,
    max_bytes: usize,
}

impl BoundedPacketQueue {
    pub fn new(name: &'static str, max_bytes: usize) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                nodes: VecDeque::new(),
                size: 0,
                aborted: false,
            }),
            cond: Condvar::new(),
            serial: SerialHandle::default(),
            max_bytes,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    // ========================================================================
    // Producer
    // ========================================================================

    pub fn put(&self, packet: Packet) -> Result<(), QueueAborted> {
        self.put_if(packet, || true).map(|_| ())
    }

    /// Append only if `admit` still holds once the queue lock is taken, so
    /// a flush racing with the check cannot be overtaken. Returns whether
    /// the packet went in.
    pub fn put_if(&self, packet: Packet, admit: impl FnOnce() -> bool) -> Result<bool, QueueAborted> {
        let mut inner = self.inner.lock();
        if inner.aborted {
            return Err(QueueAborted(self.name));
        }
        if !admit() {
            return Ok(false);
        }
        inner.size += packet.byte_size();
        let serial = self.serial.get();
        inner.nodes.push_back(Node {
            entry: Entry::Packet(packet),
            serial,
        });
        self.cond.notify_one();
        Ok(true)
    }

    pub fn put_end_of_stream(&self) -> Result<(), QueueAborted> {
        self.put_marker(Entry::EndOfStream)
    }

    fn put_marker(&self, entry: Entry) -> Result<(), QueueAborted> {
        let mut inner = self.inner.lock();
        if inner.aborted {
            return Err(QueueAborted(self.name));
        }
        let serial = self.serial.get();
        inner.nodes.push_back(Node { entry, serial });
        self.cond.notify_one();
        Ok(())
    }

    /// Drop everything queued and start a new serial.
    pub fn flush(&self) -> Serial {
        let mut inner = self.inner.lock();
        Self::clear(&mut inner);
        let serial = self.serial.bump();
        tracing::debug!(queue = self.name, serial, "packet queue flushed");
        serial
    }

    /// Flush and queue a flush marker under the new serial, in one step.
    pub fn flush_with_sentinel(&self) -> Serial {
        let mut inner = self.inner.lock();
        Self::clear(&mut inner);
        let serial = self.serial.bump();
        if !inner.aborted {
            inner.nodes.push_back(Node {
                entry: Entry::Flush,
                serial,
            });
            self.cond.notify_one();
        }
        tracing::debug!(queue = self.name, serial, "packet queue flushed with marker");
        serial
    }

    fn clear(inner: &mut Inner) {
        inner.nodes.clear();
        inner.size = 0;
    }

    // ========================================================================
    // Consumer
    // ========================================================================

    pub fn get(&self, block: bool) -> QueueGet {
        let mut inner = self.inner.lock();
        loop {
            if inner.aborted {
                return QueueGet::Quit;
            }
            if let Some(node) = inner.nodes.pop_front() {
                return match node.entry {
                    Entry::Packet(packet) => {
                        inner.size -= packet.byte_size();
                        QueueGet::Packet {
                            packet,
                            serial: node.serial,
                        }
                    }
                    Entry::Flush => QueueGet::Flush {
                        serial: node.serial,
                    },
                    Entry::EndOfStream => QueueGet::EndOfStream {
                        serial: node.serial,
                    },
                };
            }
            if !block {
                return QueueGet::Empty;
            }
            self.cond.wait(&mut inner);
        }
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Queued payload bytes.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    /// Queued entries, markers included.
    pub fn count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn serial(&self) -> Serial {
        self.serial.get()
    }

    pub fn serial_handle(&self) -> SerialHandle {
        self.serial.clone()
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn is_over_cap(&self) -> bool {
        self.size() >= self.max_bytes
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted
    }
}

impl Abortable for BoundedPacketQueue {
    fn abort(&self) {
        let mut inner = self.inner.lock();
        inner.aborted = true;
        self.cond.notify_all();
    }
}
