//! The decoding virtual machine.
//!
//! The VM is a single-threaded state machine. Each call to
//! [`Vm::next_elem`] resumes at the stored state, runs until something is
//! emitted, and returns; decoding a packet is a cooperative walk through
//! the compiled procedures. All decoder state lives in [`VmPos`], which is
//! a plain value: cloning it captures a restorable position.
//!
//! The VM owns an exclusive data source and maintains a window over the
//! most recent block. The head offset is expressed in bits within the
//! current packet; the window start is always byte-aligned.

use std::sync::Arc;

use ctfstream_metadata::{ByteOrder, Uuid};

use crate::bitreader;
use crate::elem::{self, DataRef, DsInfoData, ElemData, ErInfoData, Element, PktInfoData};
use crate::error::DecodingError;
use crate::proc::{FlFastPath, FlReadSpec, Instr, PktProc, ProcId, ReadData};
use crate::source::DataSource;

pub(crate) const SAVED_VAL_UNSET: u64 = u64::MAX;

/// States of the VM; one per kind of suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VmState {
    BeginPkt,
    BeginPktContent,
    EndPktContent,
    EndPkt,
    BeginEr,
    EndEr,
    ExecInstr,
    ExecArrayInstr,
    ReadUuidByte,
    ReadSubstrUntilNull,
    ReadSubstr,
    ReadBlobSection,
    ReadUuidBlobSection,
    EndStr,
    SetMetadataStreamUuid,
    SkipPaddingBits,
    SkipContentPaddingBits,
}

/// A stack frame: one procedure being executed.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    /// Procedure owning the instruction at `idx`.
    pub proc: ProcId,
    /// Index of the next instruction to execute.
    pub idx: usize,
    /// State to restore when this frame pops.
    pub parent_state: VmState,
    /// Array elements (or string/BLOB bytes) left to read.
    pub rem_elems: u64,
}

/// The complete decoder state, minus the data source handle.
///
/// A `VmPos` is cheap to clone relative to a decode: the clone captures the
/// exact position, including the current element and data window, and can
/// be restored into any VM over the same element sequence.
#[derive(Clone)]
pub(crate) struct VmPos {
    /// Offset of the current packet within the element sequence (bits).
    pub cur_pkt_offset_bits: u64,
    /// Head offset within the current packet (bits).
    pub head_bits: u64,
    pub state: VmState,
    /// State to restore once the remaining padding bits are skipped.
    pub post_skip_state: VmState,
    /// State to restore after a null-terminated string completes.
    pub post_str_state: VmState,
    /// Code-unit size of the string currently being scanned.
    pub str_unit_bytes: u8,
    /// Byte order of the last fixed-length read, for the
    /// no-change-within-a-byte rule.
    pub last_bo: Option<ByteOrder>,
    pub rem_bits_to_skip: u64,
    /// Last decoded integer; signed values are stored as raw bits.
    pub last_int: u64,
    /// Current data stream type or event record type id.
    pub cur_id: u64,
    pub cur_ds_idx: Option<usize>,
    pub cur_er_proc: Option<ProcId>,
    pub uuid_buf: [u8; 16],
    pub uuid_len: usize,
    pub expected_total_len_bits: Option<u64>,
    pub expected_content_len_bits: Option<u64>,
    pub stack: Vec<Frame>,
    pub saved_vals: Vec<u64>,
    pub def_clk_val: u64,
    pub pkt_info: PktInfoData,
    pub ds_info: DsInfoData,
    pub er_info: ErInfoData,
    /// Current element, stored inline.
    pub cur_elem: Option<ElemData>,
    /// Copy of the most recent data block.
    pub window: Vec<u8>,
    /// Offset of the window start within the current packet (bits,
    /// byte-aligned).
    pub window_offset_bits: u64,
}

impl VmPos {
    pub(crate) fn new(saved_vals_count: usize) -> Self {
        Self {
            cur_pkt_offset_bits: 0,
            head_bits: 0,
            state: VmState::BeginPkt,
            post_skip_state: VmState::BeginPkt,
            post_str_state: VmState::ExecInstr,
            str_unit_bytes: 1,
            last_bo: None,
            rem_bits_to_skip: 0,
            last_int: 0,
            cur_id: 0,
            cur_ds_idx: None,
            cur_er_proc: None,
            uuid_buf: [0; 16],
            uuid_len: 0,
            expected_total_len_bits: None,
            expected_content_len_bits: None,
            stack: Vec::new(),
            saved_vals: vec![SAVED_VAL_UNSET; saved_vals_count],
            def_clk_val: 0,
            pkt_info: PktInfoData::default(),
            ds_info: DsInfoData::default(),
            er_info: ErInfoData::default(),
            cur_elem: None,
            window: Vec::new(),
            window_offset_bits: 0,
        }
    }

    pub(crate) fn top(&self) -> &Frame {
        self.stack.last().expect("VM stack is empty")
    }

    pub(crate) fn top_mut(&mut self) -> &mut Frame {
        self.stack.last_mut().expect("VM stack is empty")
    }

    pub(crate) fn push_frame(&mut self, proc: ProcId) {
        let parent_state = self.state;
        self.stack.push(Frame {
            proc,
            idx: 0,
            parent_state,
            rem_elems: 0,
        });
    }

    pub(crate) fn stack_pop(&mut self) {
        self.stack.pop().expect("VM stack is empty");
    }

    pub(crate) fn set_parent_state_and_pop(&mut self) {
        self.state = self.top().parent_state;
        self.stack_pop();
    }

    pub(crate) fn goto_next_instr(&mut self) {
        self.top_mut().idx += 1;
    }

    pub(crate) fn load_new_proc(&mut self, proc: ProcId) {
        debug_assert!(self.stack.is_empty());
        self.push_frame(proc);
    }

    pub(crate) fn save_val(&mut self, pos: usize) {
        self.saved_vals[pos] = self.last_int;
    }

    pub(crate) fn saved_val(&self, pos: usize) -> u64 {
        let val = self.saved_vals[pos];
        debug_assert!(val != SAVED_VAL_UNSET);
        val
    }

    /// Fold the last decoded integer, holding the low `len_bits` bits of
    /// the clock, into the current default clock value.
    ///
    /// A new low part smaller than the current one means the counter
    /// wrapped; assume it wrapped exactly once.
    pub(crate) fn update_def_clk_val(&mut self, len_bits: u32) -> u64 {
        let new_val = self.last_int;
        if len_bits == 64 {
            self.def_clk_val = new_val;
            return new_val;
        }

        let mask = (1u64 << len_bits) - 1;
        let mut cur = self.def_clk_val;
        if new_val < cur & mask {
            cur += mask + 1;
        }
        cur &= !mask;
        cur |= new_val;
        self.def_clk_val = cur;
        cur
    }

    /// Packet content bits left before the expected content end;
    /// effectively unbounded when no content length is known yet.
    pub(crate) fn rem_content_bits(&self) -> u64 {
        match self.expected_content_len_bits {
            Some(content) => content - self.head_bits,
            None => u64::MAX,
        }
    }

    pub(crate) fn head_offset_in_elem_seq_bits(&self) -> u64 {
        self.cur_pkt_offset_bits + self.head_bits
    }

    pub(crate) fn reset_for_new_pkt(&mut self) {
        self.head_bits = 0;
        self.state = VmState::BeginPkt;
        self.last_bo = None;
        self.rem_bits_to_skip = 0;
        self.cur_ds_idx = None;
        self.cur_er_proc = None;
        self.uuid_len = 0;
        self.expected_total_len_bits = None;
        self.expected_content_len_bits = None;
        self.stack.clear();
        self.saved_vals.fill(SAVED_VAL_UNSET);
        self.def_clk_val = 0;
        self.pkt_info = PktInfoData::default();
        self.ds_info = DsInfoData::default();
        self.er_info = ErInfoData::default();
        self.window.clear();
        self.window_offset_bits = 0;
    }
}

/// What a state handler did.
enum Flow {
    /// An element was emitted; return to the caller.
    Emitted,
    /// The state changed; keep handling.
    Continue,
    /// The element sequence is exhausted.
    End,
}

/// What an instruction handler asks the main loop to do.
enum Reaction {
    ExecNextInstr,
    FetchNextInstrAndStop,
    Stop,
    ExecCurInstr,
    ChangeState,
}

enum ChunkKind {
    Substr,
    Blob,
    UuidBlob,
}

pub(crate) struct Vm {
    pkt_proc: Arc<PktProc>,
    src: Box<dyn DataSource>,
    pub(crate) pos: VmPos,
    /// Offset of the current element within the element sequence (bits).
    pub(crate) offset: u64,
    /// Monotonic mark within the current packet, for iterator ordering.
    pub(crate) mark: u64,
    pub(crate) at_end: bool,
}

impl Vm {
    pub(crate) fn new(pkt_proc: Arc<PktProc>, src: Box<dyn DataSource>) -> Self {
        let pos = VmPos::new(pkt_proc.saved_vals_count);
        Self {
            pkt_proc,
            src,
            pos,
            offset: 0,
            mark: 0,
            at_end: false,
        }
    }

    pub(crate) fn current(&self) -> Option<Element<'_>> {
        if self.at_end {
            return None;
        }
        self.pos
            .cur_elem
            .as_ref()
            .map(|e| elem::view(e, &self.pos.window))
    }

    /// Advance to the next element. Returns `false` at the end of the
    /// element sequence.
    pub(crate) fn next_elem(&mut self) -> Result<bool, DecodingError> {
        if self.at_end {
            return Ok(false);
        }
        loop {
            match self.handle_state()? {
                Flow::Emitted => return Ok(true),
                Flow::Continue => {}
                Flow::End => {
                    self.at_end = true;
                    self.offset = u64::MAX;
                    self.mark = 0;
                    self.pos.cur_elem = None;
                    return Ok(false);
                }
            }
        }
    }

    /// Position the VM at the packet starting at `byte_offset`. The next
    /// advance emits its packet beginning, or ends the iterator.
    pub(crate) fn seek_packet(&mut self, byte_offset: u64) {
        self.pos.cur_pkt_offset_bits = byte_offset * 8;
        self.pos.reset_for_new_pkt();
        self.at_end = false;
    }

    // --- State dispatch ---

    fn handle_state(&mut self) -> Result<Flow, DecodingError> {
        match self.pos.state {
            VmState::ExecInstr => self.state_exec_instr(),
            VmState::ExecArrayInstr => self.state_exec_array_instr(),
            VmState::BeginEr => self.state_begin_er(),
            VmState::EndEr => self.state_end_er(),
            VmState::ReadSubstr => self.state_read_chunk(ChunkKind::Substr),
            VmState::ReadBlobSection => self.state_read_chunk(ChunkKind::Blob),
            VmState::ReadUuidBlobSection => self.state_read_chunk(ChunkKind::UuidBlob),
            VmState::ReadSubstrUntilNull => self.state_read_substr_until_null(),
            VmState::EndStr => self.state_end_str(),
            VmState::ReadUuidByte => self.state_read_uuid_byte(),
            VmState::SetMetadataStreamUuid => self.state_set_metadata_stream_uuid(),
            VmState::SkipPaddingBits => self.state_skip_padding(false),
            VmState::SkipContentPaddingBits => self.state_skip_padding(true),
            VmState::BeginPkt => self.state_begin_pkt(),
            VmState::BeginPktContent => self.state_begin_pkt_content(),
            VmState::EndPktContent => self.state_end_pkt_content(),
            VmState::EndPkt => self.state_end_pkt(),
        }
    }

    fn state_exec_instr(&mut self) -> Result<Flow, DecodingError> {
        let pp = Arc::clone(&self.pkt_proc);
        loop {
            let (pid, idx) = {
                let frame = self.pos.top();
                (frame.proc, frame.idx)
            };
            match self.exec(&pp.proc(pid).instrs[idx])? {
                Reaction::FetchNextInstrAndStop => {
                    self.pos.goto_next_instr();
                    return Ok(Flow::Emitted);
                }
                Reaction::Stop => return Ok(Flow::Emitted),
                Reaction::ExecNextInstr => self.pos.goto_next_instr(),
                Reaction::ExecCurInstr => {}
                Reaction::ChangeState => return Ok(Flow::Continue),
            }
        }
    }

    fn state_exec_array_instr(&mut self) -> Result<Flow, DecodingError> {
        let pp = Arc::clone(&self.pkt_proc);
        loop {
            if self.pos.top().rem_elems == 0 {
                self.pos.set_parent_state_and_pop();
                return Ok(Flow::Continue);
            }
            let (pid, idx) = {
                let frame = self.pos.top();
                (frame.proc, frame.idx)
            };
            let proc = pp.proc(pid);
            if idx >= proc.instrs.len() {
                // Wrap to the next array element; the sub-procedure tail
                // already decremented the remaining count.
                self.pos.top_mut().idx = 0;
                continue;
            }
            match self.exec(&proc.instrs[idx])? {
                Reaction::FetchNextInstrAndStop => {
                    self.pos.goto_next_instr();
                    return Ok(Flow::Emitted);
                }
                Reaction::Stop => return Ok(Flow::Emitted),
                Reaction::ExecNextInstr => self.pos.goto_next_instr(),
                Reaction::ExecCurInstr => {}
                Reaction::ChangeState => return Ok(Flow::Continue),
            }
        }
    }

    fn state_begin_pkt(&mut self) -> Result<Flow, DecodingError> {
        self.mark = 0;
        self.pos.reset_for_new_pkt();

        // One bit decides between a new packet and the end of the
        // element sequence.
        if self.window_rem_bits() == 0 && !self.try_have_bits(1) {
            return Ok(Flow::End);
        }

        self.emit(ElemData::PktBegin);
        let preamble = self.pkt_proc.preamble;
        self.pos.load_new_proc(preamble);
        self.pos.state = VmState::BeginPktContent;
        Ok(Flow::Emitted)
    }

    fn state_begin_pkt_content(&mut self) -> Result<Flow, DecodingError> {
        self.emit(ElemData::PktContentBegin);
        // The packet preamble procedure is already loaded.
        self.pos.state = VmState::ExecInstr;
        Ok(Flow::Emitted)
    }

    fn state_end_pkt_content(&mut self) -> Result<Flow, DecodingError> {
        // Skip the padding between content end and packet end before
        // entering `EndPkt`. Without a total length the sequence holds a
        // single packet and there is no padding.
        let bits_to_skip = match self.pos.expected_total_len_bits {
            Some(total) => total - self.pos.head_bits,
            None => 0,
        };
        if bits_to_skip > 0 {
            self.pos.rem_bits_to_skip = bits_to_skip;
            self.pos.post_skip_state = VmState::EndPkt;
            self.pos.state = VmState::SkipPaddingBits;
        } else {
            self.pos.state = VmState::EndPkt;
        }
        self.emit(ElemData::PktContentEnd);
        Ok(Flow::Emitted)
    }

    fn state_end_pkt(&mut self) -> Result<Flow, DecodingError> {
        let offset = self.pos.head_offset_in_elem_seq_bits();
        debug_assert!(offset % 8 == 0);
        self.pos.cur_pkt_offset_bits = offset;
        self.pos.head_bits = 0;
        self.pos.window.clear();
        self.pos.window_offset_bits = 0;
        self.emit(ElemData::PktEnd);
        self.pos.state = VmState::BeginPkt;
        Ok(Flow::Emitted)
    }

    fn state_begin_er(&mut self) -> Result<Flow, DecodingError> {
        let Some(ds_idx) = self.pos.cur_ds_idx else {
            self.pos.state = VmState::EndPktContent;
            return Ok(Flow::Continue);
        };

        match self.pos.expected_content_len_bits {
            None => {
                // No content length: the packet ends where the data ends.
                if self.window_rem_bits() == 0 && !self.try_have_bits(1) {
                    self.pos.state = VmState::EndPktContent;
                    return Ok(Flow::Continue);
                }
            }
            Some(_) => {
                if self.pos.rem_content_bits() == 0 {
                    self.pos.state = VmState::EndPktContent;
                    return Ok(Flow::Continue);
                }
            }
        }

        // Align now so the iterator's offset lands after any padding.
        let er_align_bits = self.pkt_proc.ds_procs[ds_idx].er_align_bits;
        self.align_head(er_align_bits)?;

        self.emit(ElemData::ErBegin);
        let er_preamble = self.pkt_proc.ds_procs[ds_idx].er_preamble;
        self.pos.load_new_proc(er_preamble);
        self.pos.state = VmState::ExecInstr;
        Ok(Flow::Emitted)
    }

    fn state_end_er(&mut self) -> Result<Flow, DecodingError> {
        debug_assert!(self.pos.cur_er_proc.is_some());
        self.pos.cur_er_proc = None;
        self.emit(ElemData::ErEnd);
        self.pos.state = VmState::BeginEr;
        Ok(Flow::Emitted)
    }

    fn state_read_uuid_byte(&mut self) -> Result<Flow, DecodingError> {
        let pp = Arc::clone(&self.pkt_proc);
        let (pid, rem) = {
            let frame = self.pos.top();
            (frame.proc, frame.rem_elems)
        };
        if rem == 0 {
            self.pos.state = VmState::SetMetadataStreamUuid;
            return Ok(Flow::Continue);
        }

        let data = match pp.proc(pid).instrs.first() {
            Some(Instr::ReadFlUInt { data, .. }) => DataRef::from(data),
            _ => unreachable!("UUID array element procedure starts with a u8 read"),
        };
        self.require_content_bits(8)?;
        let byte = self.window_at_head()[0];
        self.pos.last_int = byte as u64;
        self.pos.uuid_buf[self.pos.uuid_len] = byte;
        self.pos.uuid_len += 1;
        self.emit(ElemData::FlUInt {
            r: data,
            val: byte as u64,
        });
        self.consume(8);
        self.pos.top_mut().rem_elems -= 1;
        Ok(Flow::Emitted)
    }

    fn state_set_metadata_stream_uuid(&mut self) -> Result<Flow, DecodingError> {
        let uuid = Uuid::from_bytes(self.pos.uuid_buf);
        self.emit(ElemData::MetadataStreamUuid { uuid });
        self.pos.set_parent_state_and_pop();
        Ok(Flow::Emitted)
    }

    /// Emit one substring or BLOB section from the window; used by the
    /// counted-string and BLOB states. The top frame's remaining-elements
    /// counter holds the bytes left to read.
    fn state_read_chunk(&mut self, kind: ChunkKind) -> Result<Flow, DecodingError> {
        debug_assert!(self.pos.head_bits % 8 == 0);

        let rem = self.pos.top().rem_elems;
        if rem == 0 {
            if matches!(kind, ChunkKind::UuidBlob) {
                self.pos.state = VmState::SetMetadataStreamUuid;
            } else {
                self.pos.set_parent_state_and_pop();
            }
            return Ok(Flow::Continue);
        }

        self.require_content_bits(8)?;
        let window_bytes = self.window_rem_bits() / 8;
        let take = window_bytes.min(rem);
        let take_bits = take * 8;
        if take_bits > self.pos.rem_content_bits() {
            return Err(DecodingError::CannotDecodeBeyondPacketContent {
                offset_bits: self.pos.head_offset_in_elem_seq_bits(),
                needed_bits: take_bits,
                rem_bits: self.pos.rem_content_bits(),
            });
        }

        let begin = self.window_head_byte_idx();
        let end = begin + take as usize;
        let elem = match kind {
            ChunkKind::Substr => ElemData::Substring { begin, end },
            ChunkKind::Blob => ElemData::BlobSection { begin, end },
            ChunkKind::UuidBlob => {
                let ulen = self.pos.uuid_len;
                self.pos.uuid_buf[ulen..ulen + take as usize]
                    .copy_from_slice(&self.pos.window[begin..end]);
                self.pos.uuid_len += take as usize;
                ElemData::BlobSection { begin, end }
            }
        };
        self.emit(elem);
        self.consume(take_bits);
        self.pos.top_mut().rem_elems -= take;
        Ok(Flow::Emitted)
    }

    fn state_read_substr_until_null(&mut self) -> Result<Flow, DecodingError> {
        debug_assert!(self.pos.head_bits % 8 == 0);
        let unit = self.pos.str_unit_bytes as u64;

        self.require_content_bits(unit * 8)?;
        let begin = self.window_head_byte_idx();
        let window_bytes = self.window_rem_bits() / 8;
        let content_bytes = (self.pos.rem_content_bits() / 8).min(window_bytes);
        let usable = (content_bytes - content_bytes % unit) as usize;
        debug_assert!(usable >= unit as usize);

        // Scan whole code units for an all-zero terminator.
        let hay = &self.pos.window[begin..begin + usable];
        let unit = unit as usize;
        let mut end_rel = usable;
        let mut found = false;
        let mut i = 0;
        while i < hay.len() {
            if hay[i..i + unit].iter().all(|b| *b == 0) {
                // Include the terminator in the final substring.
                end_rel = i + unit;
                found = true;
                break;
            }
            i += unit;
        }

        if found {
            self.pos.state = VmState::EndStr;
        }
        self.emit(ElemData::Substring {
            begin,
            end: begin + end_rel,
        });
        self.consume(end_rel as u64 * 8);
        Ok(Flow::Emitted)
    }

    fn state_end_str(&mut self) -> Result<Flow, DecodingError> {
        self.emit(ElemData::StrEnd);
        self.pos.state = self.pos.post_str_state;
        debug_assert!(matches!(
            self.pos.state,
            VmState::ExecInstr | VmState::ExecArrayInstr
        ));
        Ok(Flow::Emitted)
    }

    fn state_skip_padding(&mut self, content: bool) -> Result<Flow, DecodingError> {
        self.skip_padding_bits(content)?;
        Ok(Flow::Continue)
    }

    // --- Instruction execution ---

    fn exec(&mut self, instr: &Instr) -> Result<Reaction, DecodingError> {
        match instr {
            Instr::ReadFlBitArray { data, spec } => {
                let val = self.read_fl(data, spec)?;
                self.pos.last_int = val;
                self.emit(ElemData::FlBitArray { r: data.into(), val });
                self.consume(spec.len_bits as u64);
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::ReadFlBitMap { data, spec } => {
                let val = self.read_fl(data, spec)?;
                self.pos.last_int = val;
                self.emit(ElemData::FlBitMap { r: data.into(), val });
                self.consume(spec.len_bits as u64);
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::ReadFlBool { data, spec } => {
                let val = self.read_fl(data, spec)?;
                self.pos.last_int = val;
                self.emit(ElemData::FlBool {
                    r: data.into(),
                    val: val != 0,
                });
                self.consume(spec.len_bits as u64);
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::ReadFlUInt { data, spec } => {
                let val = self.read_fl(data, spec)?;
                self.pos.last_int = val;
                self.emit(ElemData::FlUInt { r: data.into(), val });
                self.consume(spec.len_bits as u64);
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::ReadFlSInt { data, spec } => {
                let raw = self.read_fl(data, spec)?;
                let val = bitreader::sign_extend(raw, spec.len_bits);
                self.pos.last_int = val as u64;
                self.emit(ElemData::FlSInt { r: data.into(), val });
                self.consume(spec.len_bits as u64);
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::ReadFlFloat { data, spec } => {
                let raw = self.read_fl(data, spec)?;
                let val = if spec.len_bits == 32 {
                    f32::from_bits(raw as u32) as f64
                } else {
                    f64::from_bits(raw)
                };
                self.emit(ElemData::FlFloat { r: data.into(), val });
                self.consume(spec.len_bits as u64);
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::ReadVlUInt { data } => self.exec_read_vl(data, false),
            Instr::ReadVlSInt { data } => self.exec_read_vl(data, true),
            Instr::ReadNtStr { data, encoding } => {
                self.align_head(data.align_bits)?;
                self.emit(ElemData::NtStrBegin { r: data.into() });
                self.pos.post_str_state = self.pos.state;
                self.pos.str_unit_bytes = encoding.unit_bytes() as u8;
                self.pos.state = VmState::ReadSubstrUntilNull;
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::BeginReadScope {
                scope,
                align_bits,
                proc,
            } => {
                // Align now so the iterator's offset lands after padding.
                self.align_head(*align_bits)?;
                self.emit(ElemData::ScopeBegin(*scope));
                self.pos.goto_next_instr();
                self.pos.push_frame(*proc);
                Ok(Reaction::Stop)
            }
            Instr::EndReadScope { scope } => {
                self.emit(ElemData::ScopeEnd(*scope));
                self.pos.stack_pop();
                debug_assert!(self.pos.state == VmState::ExecInstr);
                Ok(Reaction::Stop)
            }
            Instr::BeginReadStruct { data, proc } => {
                self.align_head(data.align_bits)?;
                self.emit(ElemData::StructBegin { r: data.into() });
                self.pos.goto_next_instr();
                self.pos.push_frame(*proc);
                self.pos.state = VmState::ExecInstr;
                Ok(Reaction::Stop)
            }
            Instr::EndReadStruct => {
                self.emit(ElemData::StructEnd);
                self.pos.set_parent_state_and_pop();
                Ok(Reaction::Stop)
            }
            Instr::BeginReadSlArray { data, proc, len } => {
                self.begin_read_array(
                    data,
                    *proc,
                    *len,
                    ElemData::StaticArrayBegin {
                        r: data.into(),
                        len: *len,
                    },
                    VmState::ExecArrayInstr,
                )?;
                Ok(Reaction::Stop)
            }
            Instr::BeginReadSlUuidArray { data, proc } => {
                self.pos.uuid_len = 0;
                self.begin_read_array(
                    data,
                    *proc,
                    16,
                    ElemData::StaticArrayBegin {
                        r: data.into(),
                        len: 16,
                    },
                    VmState::ReadUuidByte,
                )?;
                Ok(Reaction::Stop)
            }
            Instr::EndReadSlArray => {
                self.emit(ElemData::StaticArrayEnd);
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::BeginReadDlArray {
                data,
                proc,
                len_pos,
            } => {
                let len = self.pos.saved_val(*len_pos);
                self.begin_read_array(
                    data,
                    *proc,
                    len,
                    ElemData::DynArrayBegin {
                        r: data.into(),
                        len,
                    },
                    VmState::ExecArrayInstr,
                )?;
                Ok(Reaction::Stop)
            }
            Instr::EndReadDlArray => {
                self.emit(ElemData::DynArrayEnd);
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::BeginReadSlStr { data, len_bytes } => {
                let elem = ElemData::StaticStrBegin {
                    r: data.into(),
                    len_bytes: *len_bytes,
                };
                self.begin_read_counted(data, *len_bytes, elem, VmState::ReadSubstr)?;
                Ok(Reaction::Stop)
            }
            Instr::EndReadSlStr | Instr::EndReadDlStr => {
                self.emit(ElemData::StrEnd);
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::BeginReadDlStr { data, len_pos } => {
                let len_bytes = self.pos.saved_val(*len_pos);
                let elem = ElemData::DynStrBegin {
                    r: data.into(),
                    len_bytes,
                };
                self.begin_read_counted(data, len_bytes, elem, VmState::ReadSubstr)?;
                Ok(Reaction::Stop)
            }
            Instr::BeginReadSlBlob { data, len_bytes } => {
                let elem = ElemData::StaticBlobBegin {
                    r: data.into(),
                    len_bytes: *len_bytes,
                };
                self.begin_read_counted(data, *len_bytes, elem, VmState::ReadBlobSection)?;
                Ok(Reaction::Stop)
            }
            Instr::BeginReadSlUuidBlob { data } => {
                self.pos.uuid_len = 0;
                let elem = ElemData::StaticBlobBegin {
                    r: data.into(),
                    len_bytes: 16,
                };
                self.begin_read_counted(data, 16, elem, VmState::ReadUuidBlobSection)?;
                Ok(Reaction::Stop)
            }
            Instr::EndReadSlBlob | Instr::EndReadDlBlob => {
                self.emit(ElemData::BlobEnd);
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::BeginReadDlBlob { data, len_pos } => {
                let len_bytes = self.pos.saved_val(*len_pos);
                let elem = ElemData::DynBlobBegin {
                    r: data.into(),
                    len_bytes,
                };
                self.begin_read_counted(data, len_bytes, elem, VmState::ReadBlobSection)?;
                Ok(Reaction::Stop)
            }
            Instr::BeginReadVarUIntSel {
                data,
                sel_pos,
                opts,
            } => {
                self.align_head(data.align_bits)?;
                let sel = self.pos.saved_val(*sel_pos);
                let Some(opt) = opts.iter().find(|o| o.ranges.contains(sel)) else {
                    return Err(DecodingError::InvalidUnsignedVariantSelector {
                        offset_bits: self.pos.head_offset_in_elem_seq_bits(),
                        selector: sel,
                    });
                };
                self.emit(ElemData::VarUIntSelBegin { r: data.into(), sel });
                self.pos.goto_next_instr();
                self.pos.push_frame(opt.proc);
                self.pos.state = VmState::ExecInstr;
                Ok(Reaction::Stop)
            }
            Instr::BeginReadVarSIntSel {
                data,
                sel_pos,
                opts,
            } => {
                self.align_head(data.align_bits)?;
                let sel = self.pos.saved_val(*sel_pos) as i64;
                let Some(opt) = opts.iter().find(|o| o.ranges.contains(sel)) else {
                    return Err(DecodingError::InvalidSignedVariantSelector {
                        offset_bits: self.pos.head_offset_in_elem_seq_bits(),
                        selector: sel,
                    });
                };
                self.emit(ElemData::VarSIntSelBegin { r: data.into(), sel });
                self.pos.goto_next_instr();
                self.pos.push_frame(opt.proc);
                self.pos.state = VmState::ExecInstr;
                Ok(Reaction::Stop)
            }
            Instr::EndReadVar => {
                self.emit(ElemData::VarEnd);
                self.pos.set_parent_state_and_pop();
                Ok(Reaction::Stop)
            }
            Instr::BeginReadOptBoolSel {
                data,
                sel_pos,
                proc,
            } => {
                let enabled = self.pos.saved_val(*sel_pos) != 0;
                self.begin_read_opt(data, *proc, enabled)?;
                Ok(Reaction::Stop)
            }
            Instr::BeginReadOptUIntSel {
                data,
                sel_pos,
                ranges,
                proc,
            } => {
                let enabled = ranges.contains(self.pos.saved_val(*sel_pos));
                self.begin_read_opt(data, *proc, enabled)?;
                Ok(Reaction::Stop)
            }
            Instr::BeginReadOptSIntSel {
                data,
                sel_pos,
                ranges,
                proc,
            } => {
                let enabled = ranges.contains(self.pos.saved_val(*sel_pos) as i64);
                self.begin_read_opt(data, *proc, enabled)?;
                Ok(Reaction::Stop)
            }
            Instr::EndReadOpt => {
                self.emit(ElemData::OptEnd);
                self.pos.set_parent_state_and_pop();
                Ok(Reaction::Stop)
            }
            Instr::SaveVal { pos } => {
                self.pos.save_val(*pos);
                Ok(Reaction::ExecNextInstr)
            }
            Instr::SetCurId => {
                self.pos.cur_id = self.pos.last_int;
                Ok(Reaction::ExecNextInstr)
            }
            Instr::SetDsId => {
                self.pos.ds_info.ds_id = Some(self.pos.last_int);
                Ok(Reaction::ExecNextInstr)
            }
            Instr::SetPktSeqNum => {
                self.pos.pkt_info.seq_num = Some(self.pos.last_int);
                Ok(Reaction::ExecNextInstr)
            }
            Instr::SetPktDiscErCounterSnap => {
                self.pos.pkt_info.disc_er_counter_snap = Some(self.pos.last_int);
                Ok(Reaction::ExecNextInstr)
            }
            Instr::SetPktTotalLen => self.exec_set_pkt_total_len(),
            Instr::SetPktContentLen => self.exec_set_pkt_content_len(),
            Instr::SetPktMagicNumber => {
                self.emit(ElemData::PktMagicNumber {
                    val: self.pos.last_int,
                });
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::SetPktEndDefClkVal => {
                self.pos.pkt_info.end_def_clk_val = Some(self.pos.last_int);
                Ok(Reaction::ExecNextInstr)
            }
            Instr::UpdateDefClkVal => {
                let cycles = self.pos.update_def_clk_val(64);
                self.emit(ElemData::DefClkVal { cycles });
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::UpdateDefClkValFl { len_bits } => {
                let cycles = self.pos.update_def_clk_val(*len_bits);
                self.emit(ElemData::DefClkVal { cycles });
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::SetDst { fixed_id } => {
                let id = fixed_id.unwrap_or(self.pos.cur_id);
                let Some(idx) = self.pkt_proc.ds_proc_idx(id) else {
                    return Err(DecodingError::UnknownDataStreamType {
                        offset_bits: self.pos.head_offset_in_elem_seq_bits(),
                        id,
                    });
                };
                self.pos.cur_ds_idx = Some(idx);
                self.pos.ds_info.dst = Some(Arc::clone(&self.pkt_proc.ds_procs[idx].dst));
                Ok(Reaction::ExecNextInstr)
            }
            Instr::SetErt { fixed_id } => {
                let id = fixed_id.unwrap_or(self.pos.cur_id);
                let ds_idx = self.pos.cur_ds_idx.expect("current data stream type is set");
                let ds = &self.pkt_proc.ds_procs[ds_idx];
                let er_proc = match ds.single_er_proc() {
                    Some(single) if single.ert.id == id => Some(single),
                    _ => ds.er_proc(id),
                };
                let Some(er_proc) = er_proc else {
                    return Err(DecodingError::UnknownEventRecordType {
                        offset_bits: self.pos.head_offset_in_elem_seq_bits(),
                        id,
                    });
                };
                self.pos.cur_er_proc = Some(er_proc.proc);
                self.pos.er_info.ert = Some(Arc::clone(&er_proc.ert));
                Ok(Reaction::ExecNextInstr)
            }
            Instr::SetDsInfo => {
                let info = self.pos.ds_info.clone();
                self.emit(ElemData::DsInfo(info));
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::SetPktInfo => {
                self.pos.pkt_info.expected_total_len_bits = self.pos.expected_total_len_bits;
                self.pos.pkt_info.expected_content_len_bits = self.pos.expected_content_len_bits;
                let info = self.pos.pkt_info.clone();
                self.emit(ElemData::PktInfo(info));
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::SetErInfo => {
                let info = self.pos.er_info.clone();
                self.emit(ElemData::ErInfo(info));
                Ok(Reaction::FetchNextInstrAndStop)
            }
            Instr::EndPktPreambleProc => {
                // After the packet header.
                self.pos.stack_pop();
                debug_assert!(self.pos.stack.is_empty());
                if let Some(ds_idx) = self.pos.cur_ds_idx {
                    let proc = self.pkt_proc.ds_procs[ds_idx].pkt_preamble;
                    self.pos.load_new_proc(proc);
                    Ok(Reaction::ExecCurInstr)
                } else {
                    self.pos.state = VmState::EndPktContent;
                    Ok(Reaction::ChangeState)
                }
            }
            Instr::EndDsPktPreambleProc => {
                // After the packet context.
                self.pos.stack_pop();
                debug_assert!(self.pos.stack.is_empty());
                self.pos.state = VmState::BeginEr;
                Ok(Reaction::ChangeState)
            }
            Instr::EndDsErPreambleProc => {
                // After the event record header and common context.
                self.pos.stack_pop();
                debug_assert!(self.pos.stack.is_empty());
                let proc = self.pos.cur_er_proc.expect("current event record type is set");
                self.pos.load_new_proc(proc);
                Ok(Reaction::ExecCurInstr)
            }
            Instr::EndErProc => {
                // After the event record payload.
                self.pos.stack_pop();
                debug_assert!(self.pos.stack.is_empty());
                self.pos.state = VmState::EndEr;
                Ok(Reaction::ChangeState)
            }
            Instr::DecrRemainingElems => {
                self.pos.top_mut().rem_elems -= 1;
                Ok(Reaction::ExecNextInstr)
            }
        }
    }

    fn begin_read_array(
        &mut self,
        data: &ReadData,
        proc: ProcId,
        len: u64,
        elem: ElemData,
        next_state: VmState,
    ) -> Result<(), DecodingError> {
        self.align_head(data.align_bits)?;
        self.emit(elem);
        self.pos.goto_next_instr();
        self.pos.push_frame(proc);
        self.pos.top_mut().rem_elems = len;
        self.pos.state = next_state;
        Ok(())
    }

    fn begin_read_counted(
        &mut self,
        data: &ReadData,
        len_bytes: u64,
        elem: ElemData,
        next_state: VmState,
    ) -> Result<(), DecodingError> {
        self.align_head(data.align_bits)?;
        self.emit(elem);
        self.pos.goto_next_instr();
        let empty = self.pkt_proc.empty;
        self.pos.push_frame(empty);
        self.pos.top_mut().rem_elems = len_bytes;
        self.pos.state = next_state;
        Ok(())
    }

    fn begin_read_opt(
        &mut self,
        data: &ReadData,
        proc: ProcId,
        enabled: bool,
    ) -> Result<(), DecodingError> {
        self.align_head(data.align_bits)?;
        self.emit(ElemData::OptBegin {
            r: data.into(),
            enabled,
        });
        self.pos.goto_next_instr();
        self.pos.push_frame(proc);
        if !enabled {
            // Jump straight to the end-read-optional tail so only the end
            // element is emitted.
            let tail = self.pkt_proc.proc(proc).instrs.len() - 1;
            self.pos.top_mut().idx = tail;
        }
        self.pos.state = VmState::ExecInstr;
        Ok(())
    }

    fn exec_read_vl(&mut self, data: &ReadData, signed: bool) -> Result<Reaction, DecodingError> {
        self.align_head(data.align_bits)?;
        let start_offset = self.pos.head_offset_in_elem_seq_bits();

        let mut val = 0u64;
        let mut shift = 0u32;
        let mut len_bytes = 0u32;
        let last_group;
        loop {
            if shift >= 64 {
                return Err(DecodingError::OversizedVariableLengthInteger {
                    offset_bits: self.pos.head_offset_in_elem_seq_bits(),
                });
            }
            self.require_content_bits(8)?;
            let byte = self.window_at_head()[0];
            self.consume(8);
            len_bytes += 1;
            let group = (byte & 0x7f) as u64;
            val |= group << shift;
            if byte & 0x80 == 0 {
                last_group = group;
                break;
            }
            shift += 7;
        }

        if signed {
            let total = shift + 7;
            let mut sval = val as i64;
            if total < 64 && (last_group & 0x40) != 0 {
                sval |= !0i64 << total;
            }
            self.pos.last_int = sval as u64;
            self.emit_at(
                ElemData::VlSInt {
                    r: data.into(),
                    val: sval,
                    len_bytes,
                },
                start_offset,
            );
        } else {
            self.pos.last_int = val;
            self.emit_at(
                ElemData::VlUInt {
                    r: data.into(),
                    val,
                    len_bytes,
                },
                start_offset,
            );
        }
        Ok(Reaction::FetchNextInstrAndStop)
    }

    fn exec_set_pkt_total_len(&mut self) -> Result<Reaction, DecodingError> {
        let total = self.pos.last_int;
        if total % 8 != 0 {
            return Err(DecodingError::ExpectedPacketTotalLengthNotMultipleOf8 {
                offset_bits: self.pos.head_offset_in_elem_seq_bits(),
                len_bits: total,
            });
        }
        if let Some(content) = self.pos.expected_content_len_bits {
            if total < content {
                return Err(DecodingError::ExpectedPacketTotalLengthLessThanContentLength {
                    offset_bits: self.pos.head_offset_in_elem_seq_bits(),
                    total_bits: total,
                    content_bits: content,
                });
            }
        }
        if total < self.pos.head_bits {
            return Err(DecodingError::ExpectedPacketLengthLessThanOffsetInPacket {
                offset_bits: self.pos.head_offset_in_elem_seq_bits(),
                len_bits: total,
                head_bits: self.pos.head_bits,
            });
        }
        self.pos.expected_total_len_bits = Some(total);
        if self.pos.expected_content_len_bits.is_none() {
            self.pos.expected_content_len_bits = Some(total);
        }
        Ok(Reaction::ExecNextInstr)
    }

    fn exec_set_pkt_content_len(&mut self) -> Result<Reaction, DecodingError> {
        let content = self.pos.last_int;
        if let Some(total) = self.pos.expected_total_len_bits {
            if total < content {
                return Err(DecodingError::ExpectedPacketTotalLengthLessThanContentLength {
                    offset_bits: self.pos.head_offset_in_elem_seq_bits(),
                    total_bits: total,
                    content_bits: content,
                });
            }
        }
        if content < self.pos.head_bits {
            return Err(DecodingError::ExpectedPacketLengthLessThanOffsetInPacket {
                offset_bits: self.pos.head_offset_in_elem_seq_bits(),
                len_bits: content,
                head_bits: self.pos.head_bits,
            });
        }
        self.pos.expected_content_len_bits = Some(content);
        Ok(Reaction::ExecNextInstr)
    }

    /// Align, require, and read a fixed-length field. The head is left at
    /// the field start; the caller consumes after emitting.
    fn read_fl(&mut self, data: &ReadData, spec: &FlReadSpec) -> Result<u64, DecodingError> {
        self.align_head(data.align_bits)?;
        self.require_content_bits(spec.len_bits as u64)?;

        // A bit array which does not start on a byte boundary must have
        // the same byte order as the previous one.
        if self.pos.head_bits % 8 != 0 {
            if let Some(last_bo) = self.pos.last_bo {
                if last_bo != spec.byte_order {
                    return Err(DecodingError::ByteOrderChangeWithinByte {
                        offset_bits: self.pos.head_offset_in_elem_seq_bits(),
                        expected: last_bo,
                        found: spec.byte_order,
                    });
                }
            }
        }
        self.pos.last_bo = Some(spec.byte_order);

        let bit = (self.pos.head_bits % 8) as u32;
        let buf = self.window_at_head();
        let val = match (spec.fast, spec.byte_order) {
            (FlFastPath::A8, _) => bitreader::read_u8(buf),
            (FlFastPath::A16, ByteOrder::LittleEndian) => bitreader::read_u16_le(buf),
            (FlFastPath::A16, ByteOrder::BigEndian) => bitreader::read_u16_be(buf),
            (FlFastPath::A32, ByteOrder::LittleEndian) => bitreader::read_u32_le(buf),
            (FlFastPath::A32, ByteOrder::BigEndian) => bitreader::read_u32_be(buf),
            (FlFastPath::A64, ByteOrder::LittleEndian) => bitreader::read_u64_le(buf),
            (FlFastPath::A64, ByteOrder::BigEndian) => bitreader::read_u64_be(buf),
            (FlFastPath::None, ByteOrder::LittleEndian) => {
                if spec.bit_reversed {
                    bitreader::read_uint_le_rev(buf, bit, spec.len_bits)
                } else {
                    bitreader::read_uint_le(buf, bit, spec.len_bits)
                }
            }
            (FlFastPath::None, ByteOrder::BigEndian) => {
                if spec.bit_reversed {
                    bitreader::read_uint_be_rev(buf, bit, spec.len_bits)
                } else {
                    bitreader::read_uint_be(buf, bit, spec.len_bits)
                }
            }
        };
        Ok(val)
    }

    // --- Head, window, and padding management ---

    fn emit_at(&mut self, elem: ElemData, offset: u64) {
        self.offset = offset;
        self.mark += 1;
        self.pos.cur_elem = Some(elem);
    }

    fn emit(&mut self, elem: ElemData) {
        let offset = self.pos.head_offset_in_elem_seq_bits();
        self.emit_at(elem, offset);
    }

    fn consume(&mut self, bits: u64) {
        debug_assert!(bits <= self.window_rem_bits());
        self.pos.head_bits += bits;
    }

    fn window_rem_bits(&self) -> u64 {
        (self.pos.window_offset_bits + self.pos.window.len() as u64 * 8)
            .saturating_sub(self.pos.head_bits)
    }

    fn window_head_byte_idx(&self) -> usize {
        ((self.pos.head_bits - self.pos.window_offset_bits) / 8) as usize
    }

    fn window_at_head(&self) -> &[u8] {
        &self.pos.window[self.window_head_byte_idx()..]
    }

    /// Ensure `bits` bits are available in the window, requesting a new
    /// block from the data source if needed. Returns false when the source
    /// is exhausted before `bits` bits.
    fn try_have_bits(&mut self, bits: u64) -> bool {
        if self.window_rem_bits() >= bits {
            return true;
        }

        // Request from the byte containing the head.
        let floored_head_bits = self.pos.head_bits & !7;
        let bit_in_byte = self.pos.head_bits & 7;
        let req_offset_bytes = (self.pos.cur_pkt_offset_bits + floored_head_bits) / 8;
        let need_bytes = ((bits + bit_in_byte + 7) / 8) as usize;

        let Some(block) = self.src.data(req_offset_bytes, need_bytes) else {
            return false;
        };
        self.pos.window.clear();
        self.pos.window.extend_from_slice(block);
        self.pos.window_offset_bits = floored_head_bits;
        self.window_rem_bits() >= bits
    }

    fn require_bits(&mut self, bits: u64) -> Result<(), DecodingError> {
        if !self.try_have_bits(bits) {
            return Err(DecodingError::PrematureEndOfData {
                offset_bits: self.pos.head_offset_in_elem_seq_bits(),
                needed_bits: bits,
            });
        }
        Ok(())
    }

    fn require_content_bits(&mut self, bits: u64) -> Result<(), DecodingError> {
        let rem = self.pos.rem_content_bits();
        if bits > rem {
            return Err(DecodingError::CannotDecodeBeyondPacketContent {
                offset_bits: self.pos.head_offset_in_elem_seq_bits(),
                needed_bits: bits,
                rem_bits: rem,
            });
        }
        self.require_bits(bits)
    }

    fn align_head(&mut self, align_bits: u32) -> Result<(), DecodingError> {
        let align = align_bits as u64;
        let new_head_bits = (self.pos.head_bits + align - 1) & !(align - 1);
        let bits_to_skip = new_head_bits - self.pos.head_bits;
        if bits_to_skip == 0 {
            return Ok(());
        }
        if bits_to_skip > self.pos.rem_content_bits() {
            return Err(DecodingError::CannotDecodeBeyondPacketContent {
                offset_bits: self.pos.head_offset_in_elem_seq_bits(),
                needed_bits: bits_to_skip,
                rem_bits: self.pos.rem_content_bits(),
            });
        }
        self.pos.rem_bits_to_skip = bits_to_skip;
        self.pos.post_skip_state = self.pos.state;
        self.pos.state = VmState::SkipContentPaddingBits;
        self.skip_padding_bits(true)
    }

    fn skip_padding_bits(&mut self, content: bool) -> Result<(), DecodingError> {
        while self.pos.rem_bits_to_skip > 0 {
            if content {
                self.require_content_bits(1)?;
            } else {
                self.require_bits(1)?;
            }
            let take = self.pos.rem_bits_to_skip.min(self.window_rem_bits());
            self.pos.rem_bits_to_skip -= take;
            self.consume(take);
        }
        self.pos.state = self.pos.post_skip_state;
        Ok(())
    }
}
