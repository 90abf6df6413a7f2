//! Decoding procedures and their instructions.
//!
//! There is no numeric bytecode: a procedure is a flat sequence of
//! instruction values, and some instructions own a sub-procedure. All
//! procedures of a compiled trace type live in a single arena owned by the
//! [`PktProc`]; instructions reference sub-procedures by arena id.
//!
//! The top-level procedure is the packet preamble (packet-header scope).
//! Each data stream type then has a packet preamble procedure (packet
//! context), an event-record preamble procedure (header plus common
//! context), and one procedure per event record type.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use ctfstream_metadata::{
    ByteOrder, DataStreamType, DataType, EventRecordType, IntegerRangeSet, Scope,
    StrEncoding, StructMemberType, TraceType,
};

/// Index of a procedure within the [`PktProc`] arena.
pub(crate) type ProcId = usize;

/// Natural-alignment fast path selected for a fixed-length read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlFastPath {
    /// Bit-granular generic path.
    None,
    A8,
    A16,
    A32,
    A64,
}

/// Read specialisation of a fixed-length field, chosen by the builder.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlReadSpec {
    pub len_bits: u32,
    pub byte_order: ByteOrder,
    pub bit_reversed: bool,
    pub fast: FlFastPath,
}

/// Metadata shared by every read-data instruction.
#[derive(Debug, Clone)]
pub(crate) struct ReadData {
    pub data_type: Arc<DataType>,
    /// Owning structure member; `None` for scope roots and array/variant
    /// bodies.
    pub member: Option<Arc<StructMemberType>>,
    pub align_bits: u32,
}

/// One option of a begin-read-variant instruction.
#[derive(Debug)]
pub(crate) struct VarOpt<T> {
    pub ranges: IntegerRangeSet<T>,
    pub proc: ProcId,
}

/// A procedure instruction.
#[derive(Debug)]
pub(crate) enum Instr {
    // Leaf reads.
    ReadFlBitArray { data: ReadData, spec: FlReadSpec },
    ReadFlBitMap { data: ReadData, spec: FlReadSpec },
    ReadFlBool { data: ReadData, spec: FlReadSpec },
    ReadFlUInt { data: ReadData, spec: FlReadSpec },
    ReadFlSInt { data: ReadData, spec: FlReadSpec },
    ReadFlFloat { data: ReadData, spec: FlReadSpec },
    ReadVlUInt { data: ReadData },
    ReadVlSInt { data: ReadData },
    ReadNtStr { data: ReadData, encoding: StrEncoding },

    // Scopes.
    BeginReadScope { scope: Scope, align_bits: u32, proc: ProcId },
    EndReadScope { scope: Scope },

    // Structures. The end instruction sits at the sub-procedure tail.
    BeginReadStruct { data: ReadData, proc: ProcId },
    EndReadStruct,

    // Arrays. The end instruction follows the begin instruction in the
    // parent procedure; the sub-procedure tail decrements the remaining
    // element count.
    BeginReadSlArray { data: ReadData, proc: ProcId, len: u64 },
    BeginReadSlUuidArray { data: ReadData, proc: ProcId },
    EndReadSlArray,
    BeginReadDlArray { data: ReadData, proc: ProcId, len_pos: usize },
    EndReadDlArray,

    // Counted strings; chunked through the substring states.
    BeginReadSlStr { data: ReadData, len_bytes: u64 },
    EndReadSlStr,
    BeginReadDlStr { data: ReadData, len_pos: usize },
    EndReadDlStr,

    // BLOBs; chunked through the BLOB-section states.
    BeginReadSlBlob { data: ReadData, len_bytes: u64 },
    BeginReadSlUuidBlob { data: ReadData },
    EndReadSlBlob,
    BeginReadDlBlob { data: ReadData, len_pos: usize },
    EndReadDlBlob,

    // Variants and optionals. The end instruction sits at the option/body
    // sub-procedure tail.
    BeginReadVarUIntSel { data: ReadData, sel_pos: usize, opts: Vec<VarOpt<u64>> },
    BeginReadVarSIntSel { data: ReadData, sel_pos: usize, opts: Vec<VarOpt<i64>> },
    EndReadVar,
    BeginReadOptBoolSel { data: ReadData, sel_pos: usize, proc: ProcId },
    BeginReadOptUIntSel { data: ReadData, sel_pos: usize, ranges: IntegerRangeSet<u64>, proc: ProcId },
    BeginReadOptSIntSel { data: ReadData, sel_pos: usize, ranges: IntegerRangeSet<i64>, proc: ProcId },
    EndReadOpt,

    /// Save the last decoded integer into the saved-value slot `pos`.
    SaveVal { pos: usize },

    // Role side effects: consume the last decoded integer.
    SetCurId,
    SetDsId,
    SetPktSeqNum,
    SetPktDiscErCounterSnap,
    SetPktTotalLen,
    SetPktContentLen,
    SetPktMagicNumber,
    SetPktEndDefClkVal,
    /// Generic default-clock update (variable-length timestamp field).
    UpdateDefClkVal,
    /// Fixed-length fast path: the new value replaces the low `len_bits`
    /// bits of the clock.
    UpdateDefClkValFl { len_bits: u32 },

    /// Select the current data stream type from the current id (or the
    /// fixed id when present, which overrides it).
    SetDst { fixed_id: Option<u64> },
    /// Select the current event record type likewise.
    SetErt { fixed_id: Option<u64> },

    // Info-element emissions.
    SetDsInfo,
    SetPktInfo,
    SetErInfo,

    // Preamble terminators.
    EndPktPreambleProc,
    EndDsPktPreambleProc,
    EndDsErPreambleProc,
    EndErProc,

    /// Decrement the top frame's remaining-elements counter.
    DecrRemainingElems,
}

impl Instr {
    /// Member name carried by a read-data instruction, if any.
    pub(crate) fn member_name(&self) -> Option<&str> {
        self.read_data()
            .and_then(|d| d.member.as_ref())
            .map(|m| m.name.as_str())
    }

    pub(crate) fn read_data(&self) -> Option<&ReadData> {
        match self {
            Instr::ReadFlBitArray { data, .. }
            | Instr::ReadFlBitMap { data, .. }
            | Instr::ReadFlBool { data, .. }
            | Instr::ReadFlUInt { data, .. }
            | Instr::ReadFlSInt { data, .. }
            | Instr::ReadFlFloat { data, .. }
            | Instr::ReadVlUInt { data }
            | Instr::ReadVlSInt { data }
            | Instr::ReadNtStr { data, .. }
            | Instr::BeginReadStruct { data, .. }
            | Instr::BeginReadSlArray { data, .. }
            | Instr::BeginReadSlUuidArray { data, .. }
            | Instr::BeginReadDlArray { data, .. }
            | Instr::BeginReadSlStr { data, .. }
            | Instr::BeginReadDlStr { data, .. }
            | Instr::BeginReadSlBlob { data, .. }
            | Instr::BeginReadSlUuidBlob { data, .. }
            | Instr::BeginReadDlBlob { data, .. }
            | Instr::BeginReadVarUIntSel { data, .. }
            | Instr::BeginReadVarSIntSel { data, .. }
            | Instr::BeginReadOptBoolSel { data, .. }
            | Instr::BeginReadOptUIntSel { data, .. }
            | Instr::BeginReadOptSIntSel { data, .. } => Some(data),
            _ => None,
        }
    }
}

/// A sequence of instructions.
#[derive(Debug, Default)]
pub(crate) struct Proc {
    pub instrs: Vec<Instr>,
}

/// The compiled procedure of one event record type.
#[derive(Debug)]
pub(crate) struct ErProc {
    pub ert: Arc<EventRecordType>,
    pub proc: ProcId,
}

/// The compiled procedures of one data stream type.
///
/// Event record procedures are stored both in a dense vector indexed by id
/// (ids are typically contiguous) and in a spill map for outlier ids. The
/// vector may contain holes; the map never does.
#[derive(Debug)]
pub(crate) struct DsPktProc {
    pub dst: Arc<DataStreamType>,
    pub pkt_preamble: ProcId,
    pub er_preamble: ProcId,
    pub er_align_bits: u32,
    pub(crate) er_procs_dense: Vec<Option<ErProc>>,
    pub(crate) er_procs_spill: HashMap<u64, ErProc>,
}

/// Ids up to this bound go to the dense event-record procedure vector.
pub(crate) const ER_PROC_DENSE_MAX: u64 = 256;

impl DsPktProc {
    pub(crate) fn add_er_proc(&mut self, id: u64, er_proc: ErProc) {
        if id < ER_PROC_DENSE_MAX {
            let idx = id as usize;
            if self.er_procs_dense.len() <= idx {
                self.er_procs_dense.resize_with(idx + 1, || None);
            }
            self.er_procs_dense[idx] = Some(er_proc);
        } else {
            self.er_procs_spill.insert(id, er_proc);
        }
    }

    pub(crate) fn er_proc(&self, id: u64) -> Option<&ErProc> {
        if let Some(slot) = self.er_procs_dense.get(id as usize) {
            if let Some(er_proc) = slot {
                return Some(er_proc);
            }
        }
        self.er_procs_spill.get(&id)
    }

    /// The single event record procedure, when exactly one exists.
    pub(crate) fn single_er_proc(&self) -> Option<&ErProc> {
        let mut found = None;
        for er_proc in self
            .er_procs_dense
            .iter()
            .flatten()
            .chain(self.er_procs_spill.values())
        {
            if found.is_some() {
                return None;
            }
            found = Some(er_proc);
        }
        found
    }
}

/// The whole compiled form of a trace type.
#[derive(Debug)]
pub(crate) struct PktProc {
    pub trace_type: Arc<TraceType>,
    procs: Vec<Proc>,
    /// Reserved empty procedure, used by frames that only count bytes.
    pub empty: ProcId,
    pub preamble: ProcId,
    pub ds_procs: Vec<DsPktProc>,
    ds_ids: HashMap<u64, usize>,
    pub saved_vals_count: usize,
}

impl PktProc {
    pub(crate) fn new(trace_type: Arc<TraceType>) -> Self {
        let mut procs = Vec::new();
        procs.push(Proc::default());
        Self {
            trace_type,
            procs,
            empty: 0,
            preamble: 0,
            ds_procs: Vec::new(),
            ds_ids: HashMap::new(),
            saved_vals_count: 0,
        }
    }

    pub(crate) fn alloc_proc(&mut self) -> ProcId {
        self.procs.push(Proc::default());
        self.procs.len() - 1
    }

    pub(crate) fn proc(&self, id: ProcId) -> &Proc {
        &self.procs[id]
    }

    pub(crate) fn proc_mut(&mut self, id: ProcId) -> &mut Proc {
        &mut self.procs[id]
    }

    pub(crate) fn add_ds_proc(&mut self, ds_proc: DsPktProc) {
        self.ds_ids.insert(ds_proc.dst.id, self.ds_procs.len());
        self.ds_procs.push(ds_proc);
    }

    pub(crate) fn ds_proc_idx(&self, id: u64) -> Option<usize> {
        self.ds_ids.get(&id).copied()
    }

    /// Human-readable dump of every procedure, for debugging.
    pub(crate) fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "packet preamble:");
        self.dump_proc(&mut out, self.preamble, 1);
        for ds in &self.ds_procs {
            let _ = writeln!(out, "data stream type {}:", ds.dst.id);
            let _ = writeln!(out, "  packet preamble:");
            self.dump_proc(&mut out, ds.pkt_preamble, 2);
            let _ = writeln!(out, "  event record preamble:");
            self.dump_proc(&mut out, ds.er_preamble, 2);
            for er_proc in ds
                .er_procs_dense
                .iter()
                .flatten()
                .chain(ds.er_procs_spill.values())
            {
                let _ = writeln!(out, "  event record type {}:", er_proc.ert.id);
                self.dump_proc(&mut out, er_proc.proc, 2);
            }
        }
        out
    }

    fn dump_proc(&self, out: &mut String, id: ProcId, indent: usize) {
        for instr in &self.procs[id].instrs {
            let pad = "  ".repeat(indent);
            let name = instr_name(instr);
            match instr {
                Instr::SaveVal { pos } => {
                    let _ = writeln!(out, "{pad}{name} pos={pos}");
                }
                Instr::BeginReadDlArray { len_pos, .. }
                | Instr::BeginReadDlStr { len_pos, .. }
                | Instr::BeginReadDlBlob { len_pos, .. } => {
                    let _ = writeln!(out, "{pad}{name} len-pos={len_pos}");
                }
                Instr::BeginReadSlArray { len, .. } => {
                    let _ = writeln!(out, "{pad}{name} len={len}");
                }
                _ => {
                    let member = instr.member_name().unwrap_or("");
                    if member.is_empty() {
                        let _ = writeln!(out, "{pad}{name}");
                    } else {
                        let _ = writeln!(out, "{pad}{name} member={member}");
                    }
                }
            }
            match instr {
                Instr::BeginReadScope { proc, .. }
                | Instr::BeginReadStruct { proc, .. }
                | Instr::BeginReadSlArray { proc, .. }
                | Instr::BeginReadSlUuidArray { proc, .. }
                | Instr::BeginReadDlArray { proc, .. }
                | Instr::BeginReadOptBoolSel { proc, .. }
                | Instr::BeginReadOptUIntSel { proc, .. }
                | Instr::BeginReadOptSIntSel { proc, .. } => {
                    self.dump_proc(out, *proc, indent + 1);
                }
                Instr::BeginReadVarUIntSel { opts, .. } => {
                    for opt in opts {
                        let _ = writeln!(out, "{pad}  <option>");
                        self.dump_proc(out, opt.proc, indent + 2);
                    }
                }
                Instr::BeginReadVarSIntSel { opts, .. } => {
                    for opt in opts {
                        let _ = writeln!(out, "{pad}  <option>");
                        self.dump_proc(out, opt.proc, indent + 2);
                    }
                }
                _ => {}
            }
        }
    }
}

fn instr_name(instr: &Instr) -> &'static str {
    match instr {
        Instr::ReadFlBitArray { .. } => "read-fl-bit-array",
        Instr::ReadFlBitMap { .. } => "read-fl-bit-map",
        Instr::ReadFlBool { .. } => "read-fl-bool",
        Instr::ReadFlUInt { .. } => "read-fl-uint",
        Instr::ReadFlSInt { .. } => "read-fl-sint",
        Instr::ReadFlFloat { .. } => "read-fl-float",
        Instr::ReadVlUInt { .. } => "read-vl-uint",
        Instr::ReadVlSInt { .. } => "read-vl-sint",
        Instr::ReadNtStr { .. } => "read-nt-str",
        Instr::BeginReadScope { .. } => "begin-read-scope",
        Instr::EndReadScope { .. } => "end-read-scope",
        Instr::BeginReadStruct { .. } => "begin-read-struct",
        Instr::EndReadStruct => "end-read-struct",
        Instr::BeginReadSlArray { .. } => "begin-read-sl-array",
        Instr::BeginReadSlUuidArray { .. } => "begin-read-sl-uuid-array",
        Instr::EndReadSlArray => "end-read-sl-array",
        Instr::BeginReadDlArray { .. } => "begin-read-dl-array",
        Instr::EndReadDlArray => "end-read-dl-array",
        Instr::BeginReadSlStr { .. } => "begin-read-sl-str",
        Instr::EndReadSlStr => "end-read-sl-str",
        Instr::BeginReadDlStr { .. } => "begin-read-dl-str",
        Instr::EndReadDlStr => "end-read-dl-str",
        Instr::BeginReadSlBlob { .. } => "begin-read-sl-blob",
        Instr::BeginReadSlUuidBlob { .. } => "begin-read-sl-uuid-blob",
        Instr::EndReadSlBlob => "end-read-sl-blob",
        Instr::BeginReadDlBlob { .. } => "begin-read-dl-blob",
        Instr::EndReadDlBlob => "end-read-dl-blob",
        Instr::BeginReadVarUIntSel { .. } => "begin-read-var-uint-sel",
        Instr::BeginReadVarSIntSel { .. } => "begin-read-var-sint-sel",
        Instr::EndReadVar => "end-read-var",
        Instr::BeginReadOptBoolSel { .. } => "begin-read-opt-bool-sel",
        Instr::BeginReadOptUIntSel { .. } => "begin-read-opt-uint-sel",
        Instr::BeginReadOptSIntSel { .. } => "begin-read-opt-sint-sel",
        Instr::EndReadOpt => "end-read-opt",
        Instr::SaveVal { .. } => "save-val",
        Instr::SetCurId => "set-cur-id",
        Instr::SetDsId => "set-ds-id",
        Instr::SetPktSeqNum => "set-pkt-seq-num",
        Instr::SetPktDiscErCounterSnap => "set-pkt-disc-er-counter-snap",
        Instr::SetPktTotalLen => "set-pkt-total-len",
        Instr::SetPktContentLen => "set-pkt-content-len",
        Instr::SetPktMagicNumber => "set-pkt-magic-number",
        Instr::SetPktEndDefClkVal => "set-pkt-end-def-clk-val",
        Instr::UpdateDefClkVal => "update-def-clk-val",
        Instr::UpdateDefClkValFl { .. } => "update-def-clk-val-fl",
        Instr::SetDst { .. } => "set-dst",
        Instr::SetErt { .. } => "set-ert",
        Instr::SetDsInfo => "set-ds-info",
        Instr::SetPktInfo => "set-pkt-info",
        Instr::SetErInfo => "set-er-info",
        Instr::EndPktPreambleProc => "end-pkt-preamble-proc",
        Instr::EndDsPktPreambleProc => "end-ds-pkt-preamble-proc",
        Instr::EndDsErPreambleProc => "end-ds-er-preamble-proc",
        Instr::EndErProc => "end-er-proc",
        Instr::DecrRemainingElems => "decr-remaining-elems",
    }
}
