//! Tombstone-based range deletion and per-file garbage collection.

use crate::domain::file_controller::{segment_path, segment_temp_path};
use crate::domain::index::{IndexState, Pointer, Tombstone};
use crate::domain::Db;
use crate::error::{FennecError, Result};
use crate::telem::TimeRange;
use std::fs::OpenOptions;
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use tracing::debug;

impl Db {
    /// Deletes the byte span described by `tr` from the index.
    ///
    /// `start_offset` is the byte length of the surviving prefix inside the
    /// first affected pointer; `end_offset` is the byte length of the
    /// surviving suffix inside the last. Endpoints outside any pointer are
    /// expected to have been snapped by the caller (offset 0 on that side).
    /// Freed extents become tombstones; pointers wholly inside the range
    /// are removed, and a pointer containing an endpoint is shortened or
    /// split. Deletions entirely outside the stored domains are no-ops.
    pub fn delete(&self, start_offset: i64, end_offset: i64, tr: TimeRange) -> Result<()> {
        self.check_open()?;
        if !tr.valid() {
            return Err(FennecError::Validation(format!(
                "delete start {} cannot be after delete end {}",
                tr.start, tr.end
            )));
        }
        if tr.is_empty() {
            return Ok(());
        }
        let mut state = self.idx.write();
        // First pointer ending after the start, last pointer starting before
        // the end. A touching pointer on either side is unaffected.
        let start_pos = state.search_ge(tr.start);
        let end_pos = state
            .pointers
            .partition_point(|p| p.time_range.start < tr.end) as i64
            - 1;
        if start_pos > end_pos {
            return Ok(());
        }
        let (Some(start), Some(end)) = (state.get(start_pos), state.get(end_pos)) else {
            return Ok(());
        };

        if start_offset < 0 || start_offset > start.length as i64 {
            return Err(FennecError::validation(
                "deletion start offset exceeds the pointer's length",
            ));
        }
        if end_offset < 0 || end_offset > end.length as i64 {
            return Err(FennecError::validation(
                "deletion end offset exceeds the pointer's length",
            ));
        }
        let so = start_offset as u32;
        let eo = end_offset as u32;

        if start_pos == end_pos {
            if so + eo > start.length {
                return Err(FennecError::validation(
                    "deletion offsets overlap within a single pointer",
                ));
            }
            state.insert_tombstone(
                start.file_key,
                Tombstone {
                    offset: start.offset + so,
                    length: start.length - so - eo,
                },
            );
        } else {
            state.insert_tombstone(
                start.file_key,
                Tombstone {
                    offset: start.offset + so,
                    length: start.length - so,
                },
            );
            for pos in start_pos + 1..end_pos {
                let p = state.get(pos).expect("position in range");
                state.insert_tombstone(
                    p.file_key,
                    Tombstone {
                        offset: p.offset,
                        length: p.length,
                    },
                );
            }
            state.insert_tombstone(
                end.file_key,
                Tombstone {
                    offset: end.offset,
                    length: end.length - eo,
                },
            );
        }

        let mut kept = Vec::with_capacity(2);
        if so > 0 {
            kept.push(Pointer {
                time_range: TimeRange::new(start.time_range.start, tr.start),
                file_key: start.file_key,
                offset: start.offset,
                length: so,
            });
        }
        if eo > 0 {
            kept.push(Pointer {
                time_range: TimeRange::new(tr.end, end.time_range.end),
                file_key: end.file_key,
                offset: end.offset + end.length - eo,
                length: eo,
            });
        }
        state
            .pointers
            .splice(start_pos as usize..=end_pos as usize, kept);
        self.idx.persist_state(&state)
    }

    /// Rewrites every file whose tombstoned bytes exceed the configured
    /// threshold fraction of the file size limit, compacting live extents
    /// and reclaiming the freed space. Files with an in-flight writer are
    /// skipped and retried on a later pass.
    pub fn garbage_collect(&self) -> Result<()> {
        self.check_open()?;
        let mut state = self.idx.write();
        let candidates: Vec<u16> = state.tombstones.keys().copied().collect();
        let mut collected = false;
        for file_key in candidates {
            let tomb_bytes = state.tombstone_bytes(file_key);
            if tomb_bytes == 0 {
                state.tombstones.remove(&file_key);
                continue;
            }
            let proportion = tomb_bytes as f64 / self.cfg.file_size as f64;
            if proportion <= self.cfg.gc_threshold as f64 {
                continue;
            }
            if self.files.has_active_writer(file_key) {
                debug!(file_key, "skipping collection of file with active writer");
                continue;
            }
            if self.collect_file(&mut state, file_key)? {
                state.tombstones.remove(&file_key);
                collected = true;
            }
        }
        if collected {
            self.idx.persist_state(&state)?;
        }
        Ok(())
    }

    /// Streams the live extents of `file_key` into a temp file with offsets
    /// compacted by the cumulative prior tombstone length, then swaps the
    /// temp file into place under the file-controller lock. Returns false
    /// when a writer acquired the file mid-pass and the swap was abandoned.
    fn collect_file(&self, state: &mut IndexState, file_key: u16) -> Result<bool> {
        // Live extents in offset order. Index positions are remembered so
        // the pointers can be rewritten after the copy.
        let mut live: Vec<(usize, Pointer)> = state
            .pointers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.file_key == file_key)
            .map(|(i, p)| (i, *p))
            .collect();
        live.sort_by_key(|(_, p)| p.offset);
        let tombstones = state.tombstones.get(&file_key).cloned().unwrap_or_default();

        let temp_path = segment_temp_path(&self.dir, file_key);
        let mut temp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;

        let mut new_offsets: Vec<(usize, u32)> = Vec::with_capacity(live.len());
        {
            let mut reader = self.files.acquire_reader(file_key)?;
            let mut prior: u32 = 0;
            let mut tomb_iter = tombstones.iter().peekable();
            let mut buf = vec![0u8; self.cfg.read_chunk_size as usize];
            for (pos, ptr) in &live {
                while let Some(t) = tomb_iter.peek() {
                    if t.offset < ptr.offset {
                        prior += t.length;
                        tomb_iter.next();
                    } else {
                        break;
                    }
                }
                let new_offset = ptr.offset - prior;
                let mut copied: u64 = 0;
                while copied < ptr.length as u64 {
                    let n = buf.len().min((ptr.length as u64 - copied) as usize);
                    reader
                        .file
                        .seek(SeekFrom::Start(ptr.offset as u64 + copied))?;
                    reader.file.read_exact(&mut buf[..n])?;
                    temp.seek(SeekFrom::Start(new_offset as u64 + copied))?;
                    temp.write_all(&buf[..n])?;
                    copied += n as u64;
                }
                new_offsets.push((*pos, new_offset));
            }
            temp.flush()?;
            drop(temp);
            self.files.release_reader(reader);
        }

        let path = segment_path(&self.dir, file_key);
        let swapped = self.files.with_file_removed(file_key, || {
            std::fs::remove_file(&path)?;
            std::fs::rename(&temp_path, &path)?;
            Ok(())
        });
        if let Err(e) = swapped {
            debug!(file_key, %e, "abandoning collection, file reacquired");
            let _ = std::fs::remove_file(&temp_path);
            return Ok(false);
        }

        for (pos, new_offset) in new_offsets {
            state.pointers[pos].offset = new_offset;
        }
        debug!(file_key, "collected segment file");
        Ok(true)
    }
}
