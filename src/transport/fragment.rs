//! Fragmentation of bodies larger than one datagram.
//!
//! The sender cuts a body into equal chunks sharing a group id; the receiver
//! collects them in a [`FragmentAssembler`] until every part has arrived or
//! the group expires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::frame::{FragmentHeader, FrameError};
use crate::alloc::Allocator;

/// Cut `body` into chunks of at most `chunk_size` bytes tagged with `id`.
///
/// Fails if the body needs more than 65536 fragments.
pub fn split_fragments(
    id: u16,
    body: &[u8],
    chunk_size: usize,
) -> Result<impl Iterator<Item = (FragmentHeader, &[u8])>, FrameError> {
    let chunk_size = chunk_size.max(1);
    let last = body.len().saturating_sub(1) / chunk_size;
    let limit = (usize::from(u16::MAX) + 1) * chunk_size;
    let last = u16::try_from(last).map_err(|_| FrameError::FragmentTooLarge {
        size: body.len(),
        limit,
    })?;
    Ok(body
        .chunks(chunk_size)
        .enumerate()
        .map(move |(part, chunk)| {
            (
                FragmentHeader {
                    id,
                    part: part as u16,
                    last,
                },
                chunk,
            )
        }))
}

#[derive(Debug)]
struct FragmentGroup {
    last: u16,
    received: usize,
    size: usize,
    parts: Vec<Option<Vec<u8>>>,
    deadline: Instant,
}

/// Collects fragment groups until they are complete.
#[derive(Debug)]
pub struct FragmentAssembler {
    groups: HashMap<u16, FragmentGroup>,
    allocator: Arc<Allocator>,
    timeout: Duration,
}

impl FragmentAssembler {
    /// Create an assembler whose incomplete groups live for `timeout`.
    pub fn new(allocator: Arc<Allocator>, timeout: Duration) -> Self {
        Self {
            groups: HashMap::new(),
            allocator,
            timeout,
        }
    }

    /// Add one fragment.
    ///
    /// Returns the reassembled body once the group is complete. The body is
    /// an allocator message buffer; hand it back with
    /// [`Allocator::return_message`] when done.
    pub fn insert(
        &mut self,
        now: Instant,
        header: FragmentHeader,
        chunk: &[u8],
    ) -> Result<Option<Vec<u8>>, FrameError> {
        let FragmentHeader { id, part, last } = header;
        if part > last {
            return Err(FrameError::InvalidFragment { part, last });
        }

        let limit = self.allocator.max_length();
        let timeout = self.timeout;
        let group = self.groups.entry(id).or_insert_with(|| FragmentGroup {
            last,
            received: 0,
            size: 0,
            parts: vec![None; usize::from(last) + 1],
            deadline: now + timeout,
        });

        if group.last != last {
            return Err(FrameError::FragmentMismatch { id });
        }
        let slot = &mut group.parts[usize::from(part)];
        if slot.is_some() {
            return Err(FrameError::DuplicateFragment { id, part });
        }
        let size = group.size + chunk.len();
        if size > limit {
            if let Some(group) = self.groups.remove(&id) {
                self.release(group);
            }
            return Err(FrameError::FragmentTooLarge { size, limit });
        }

        let mut buffer = self.allocator.create_message(chunk.len());
        buffer.copy_from_slice(chunk);
        *slot = Some(buffer);
        group.size = size;
        group.received += 1;

        if group.received < group.parts.len() {
            return Ok(None);
        }

        let Some(group) = self.groups.remove(&id) else {
            return Ok(None);
        };
        let mut body = self.allocator.create_message(group.size);
        let mut offset = 0;
        for chunk in group.parts.iter().flatten() {
            body[offset..offset + chunk.len()].copy_from_slice(chunk);
            offset += chunk.len();
        }
        self.release(group);
        tracing::trace!(id, size = body.len(), "fragment group complete");
        Ok(Some(body))
    }

    /// Drop groups whose deadline has passed. Returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<u16> = self
            .groups
            .iter()
            .filter(|(_, group)| now >= group.deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(group) = self.groups.remove(id) {
                tracing::debug!(
                    id,
                    received = group.received,
                    expected = group.parts.len(),
                    "fragment group expired"
                );
                self.release(group);
            }
        }
        expired.len()
    }

    /// Number of incomplete groups.
    pub fn pending(&self) -> usize {
        self.groups.len()
    }

    /// Drop every group.
    pub fn clear(&mut self) {
        let groups: Vec<FragmentGroup> = self.groups.drain().map(|(_, group)| group).collect();
        for group in groups {
            self.release(group);
        }
    }

    fn release(&self, group: FragmentGroup) {
        for chunk in group.parts.into_iter().flatten() {
            self.allocator.return_message(chunk);
        }
    }
}
