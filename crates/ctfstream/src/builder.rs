//! Compilation of a trace type into decoding procedures.
//!
//! Lowering is a structural recursion: a structure becomes a begin-struct
//! instruction owning the member reads, an array becomes a begin-array
//! instruction owning its element procedure, and so on. On top of that the
//! builder:
//!
//! - allocates saved-value slots for every dynamic-length and selector
//!   reference, inserting a save-value instruction right after the
//!   referenced field's read instruction (slots are dense, assigned in
//!   first-reference order, and shared between referrers of the same
//!   field);
//! - appends a side-effect instruction after every read carrying an
//!   unsigned-integer role;
//! - picks the natural-alignment fast path for every fixed-length read
//!   whose alignment allows it;
//! - assembles the preamble procedures and their end markers.

use std::collections::HashMap;
use std::sync::Arc;

use ctfstream_metadata::{
    DataLocation, DataType, Scope, StructMemberType, TraceType, UnsignedIntegerRole,
};

use crate::error::BuildError;
use crate::proc::{
    DsPktProc, ErProc, FlFastPath, FlReadSpec, Instr, PktProc, ProcId, ReadData, VarOpt,
};

/// What a data location is expected to supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefKind {
    Length,
    Selector,
}

/// Saved-value slot key: the location plus the type context it resolves in,
/// so that per-event-record scopes of different types never collide.
type SlotKey = (Option<u64>, Option<u64>, Scope, Vec<String>);

pub(crate) fn build_pkt_proc(trace_type: &Arc<TraceType>) -> Result<PktProc, BuildError> {
    let mut builder = PktProcBuilder {
        pkt_proc: PktProc::new(Arc::clone(trace_type)),
        scope_procs: HashMap::new(),
        slots: HashMap::new(),
        next_slot: 0,
        cur_dst_id: None,
        cur_ert_id: None,
        saw_dst_id_role: false,
        saw_ert_id_role: false,
    };
    builder.build()?;
    let pkt_proc = builder.pkt_proc;

    if std::env::var("CTFSTREAM_DEBUG_PRINT_PROC").as_deref() == Ok("1") {
        eprintln!("{}", pkt_proc.dump());
    }
    log::trace!("compiled packet procedure:\n{}", pkt_proc.dump());
    Ok(pkt_proc)
}

struct PktProcBuilder {
    pkt_proc: PktProc,
    /// Scope procedures of the context currently being built.
    scope_procs: HashMap<Scope, ProcId>,
    slots: HashMap<SlotKey, usize>,
    next_slot: usize,
    cur_dst_id: Option<u64>,
    cur_ert_id: Option<u64>,
    saw_dst_id_role: bool,
    saw_ert_id_role: bool,
}

impl PktProcBuilder {
    fn build(&mut self) -> Result<(), BuildError> {
        let tt = Arc::clone(&self.pkt_proc.trace_type);

        let preamble = self.pkt_proc.alloc_proc();
        self.pkt_proc.preamble = preamble;
        if let Some(header) = &tt.packet_header {
            self.lower_scope(preamble, Scope::PacketHeader, header)?;
        }
        if !tt.data_stream_types().is_empty() {
            let fixed_id = if tt.data_stream_types().len() == 1 && !self.saw_dst_id_role {
                Some(tt.data_stream_types()[0].id)
            } else {
                None
            };
            self.push(preamble, Instr::SetDst { fixed_id });
            self.push(preamble, Instr::SetDsInfo);
        }
        self.push(preamble, Instr::EndPktPreambleProc);

        for dst in tt.data_stream_types() {
            self.cur_dst_id = Some(dst.id);
            self.saw_ert_id_role = false;

            let pkt_preamble = self.pkt_proc.alloc_proc();
            if let Some(ctx) = &dst.packet_context {
                self.lower_scope(pkt_preamble, Scope::PacketContext, ctx)?;
            }
            self.push(pkt_preamble, Instr::SetPktInfo);
            self.push(pkt_preamble, Instr::EndDsPktPreambleProc);

            let er_preamble = self.pkt_proc.alloc_proc();
            if let Some(header) = &dst.event_record_header {
                self.lower_scope(er_preamble, Scope::EventRecordHeader, header)?;
            }
            if let Some(ctx) = &dst.event_record_common_context {
                self.lower_scope(er_preamble, Scope::EventRecordCommonContext, ctx)?;
            }
            let fixed_id = if dst.event_record_types().len() == 1 && !self.saw_ert_id_role {
                Some(dst.event_record_types()[0].id)
            } else {
                None
            };
            self.push(er_preamble, Instr::SetErt { fixed_id });
            self.push(er_preamble, Instr::SetErInfo);
            self.push(er_preamble, Instr::EndDsErPreambleProc);

            let er_align_bits = [
                dst.event_record_header.as_ref(),
                dst.event_record_common_context.as_ref(),
            ]
            .into_iter()
            .flatten()
            .map(|dt| dt.alignment_bits())
            .max()
            .unwrap_or(1);

            let mut ds_proc = DsPktProc {
                dst: Arc::clone(dst),
                pkt_preamble,
                er_preamble,
                er_align_bits,
                er_procs_dense: Vec::new(),
                er_procs_spill: HashMap::new(),
            };

            for ert in dst.event_record_types() {
                self.cur_ert_id = Some(ert.id);
                let proc = self.pkt_proc.alloc_proc();
                if let Some(ctx) = &ert.specific_context {
                    self.lower_scope(proc, Scope::EventRecordSpecificContext, ctx)?;
                }
                if let Some(payload) = &ert.payload {
                    self.lower_scope(proc, Scope::EventRecordPayload, payload)?;
                }
                self.push(proc, Instr::EndErProc);
                ds_proc.add_er_proc(
                    ert.id,
                    ErProc {
                        ert: Arc::clone(ert),
                        proc,
                    },
                );
                self.scope_procs.remove(&Scope::EventRecordSpecificContext);
                self.scope_procs.remove(&Scope::EventRecordPayload);
                self.cur_ert_id = None;
            }

            self.pkt_proc.add_ds_proc(ds_proc);
            self.scope_procs.remove(&Scope::PacketContext);
            self.scope_procs.remove(&Scope::EventRecordHeader);
            self.scope_procs.remove(&Scope::EventRecordCommonContext);
            self.cur_dst_id = None;
        }

        self.pkt_proc.saved_vals_count = self.next_slot;
        Ok(())
    }

    fn push(&mut self, target: ProcId, instr: Instr) {
        self.pkt_proc.proc_mut(target).instrs.push(instr);
    }

    fn lower_scope(
        &mut self,
        target: ProcId,
        scope: Scope,
        dt: &Arc<DataType>,
    ) -> Result<(), BuildError> {
        let sub = self.pkt_proc.alloc_proc();
        self.scope_procs.insert(scope, sub);
        let align_bits = dt.alignment_bits();
        self.push(
            target,
            Instr::BeginReadScope {
                scope,
                align_bits,
                proc: sub,
            },
        );
        self.lower_dt(sub, scope, dt, None)?;
        self.push(sub, Instr::EndReadScope { scope });
        Ok(())
    }

    fn lower_dt(
        &mut self,
        target: ProcId,
        scope: Scope,
        dt: &Arc<DataType>,
        member: Option<Arc<StructMemberType>>,
    ) -> Result<(), BuildError> {
        let data = ReadData {
            data_type: Arc::clone(dt),
            member,
            align_bits: dt.alignment_bits(),
        };

        match dt.as_ref() {
            DataType::FixedBitArray(t) => {
                let spec = fl_spec(t.len_bits, t.align_bits, t.byte_order, t.bit_reversed);
                self.push(target, Instr::ReadFlBitArray { data, spec });
            }
            DataType::FixedBitMap(t) => {
                let spec = fl_spec(t.len_bits, t.align_bits, t.byte_order, t.bit_reversed);
                self.push(target, Instr::ReadFlBitMap { data, spec });
            }
            DataType::FixedBool(t) => {
                let spec = fl_spec(t.len_bits, t.align_bits, t.byte_order, t.bit_reversed);
                self.push(target, Instr::ReadFlBool { data, spec });
            }
            DataType::FixedUInt(t) => {
                let spec = fl_spec(t.len_bits, t.align_bits, t.byte_order, t.bit_reversed);
                self.push(target, Instr::ReadFlUInt { data, spec });
                for role in &t.roles {
                    self.push_role_instr(target, *role, Some(t.len_bits));
                }
            }
            DataType::FixedSInt(t) => {
                let spec = fl_spec(t.len_bits, t.align_bits, t.byte_order, t.bit_reversed);
                self.push(target, Instr::ReadFlSInt { data, spec });
            }
            DataType::FixedFloat(t) => {
                let spec = fl_spec(t.len_bits, t.align_bits, t.byte_order, t.bit_reversed);
                self.push(target, Instr::ReadFlFloat { data, spec });
            }
            DataType::VarUInt(t) => {
                self.push(target, Instr::ReadVlUInt { data });
                for role in &t.roles {
                    self.push_role_instr(target, *role, None);
                }
            }
            DataType::VarSInt(_) => {
                self.push(target, Instr::ReadVlSInt { data });
            }
            DataType::NullTermStr(t) => {
                self.push(
                    target,
                    Instr::ReadNtStr {
                        data,
                        encoding: t.encoding,
                    },
                );
            }
            DataType::Struct(st) => {
                let body = self.pkt_proc.alloc_proc();
                self.push(target, Instr::BeginReadStruct { data, proc: body });
                for m in &st.members {
                    self.lower_dt(body, scope, &m.data_type, Some(Arc::clone(m)))?;
                }
                self.push(body, Instr::EndReadStruct);
            }
            DataType::StaticArray(t) => {
                let body = self.pkt_proc.alloc_proc();
                if t.has_metadata_stream_uuid_role {
                    self.push(target, Instr::BeginReadSlUuidArray { data, proc: body });
                } else {
                    self.push(
                        target,
                        Instr::BeginReadSlArray {
                            data,
                            proc: body,
                            len: t.len,
                        },
                    );
                }
                self.lower_dt(body, scope, &t.elem_type, None)?;
                self.push(body, Instr::DecrRemainingElems);
                self.push(target, Instr::EndReadSlArray);
            }
            DataType::DynArray(t) => {
                let len_pos = self.slot_for(&t.len_location, RefKind::Length)?;
                let body = self.pkt_proc.alloc_proc();
                self.push(
                    target,
                    Instr::BeginReadDlArray {
                        data,
                        proc: body,
                        len_pos,
                    },
                );
                self.lower_dt(body, scope, &t.elem_type, None)?;
                self.push(body, Instr::DecrRemainingElems);
                self.push(target, Instr::EndReadDlArray);
            }
            DataType::StaticStr(t) => {
                self.push(
                    target,
                    Instr::BeginReadSlStr {
                        data,
                        len_bytes: t.len_bytes,
                    },
                );
                self.push(target, Instr::EndReadSlStr);
            }
            DataType::DynStr(t) => {
                let len_pos = self.slot_for(&t.len_location, RefKind::Length)?;
                self.push(target, Instr::BeginReadDlStr { data, len_pos });
                self.push(target, Instr::EndReadDlStr);
            }
            DataType::StaticBlob(t) => {
                if t.has_metadata_stream_uuid_role {
                    self.push(target, Instr::BeginReadSlUuidBlob { data });
                } else {
                    self.push(
                        target,
                        Instr::BeginReadSlBlob {
                            data,
                            len_bytes: t.len_bytes,
                        },
                    );
                }
                self.push(target, Instr::EndReadSlBlob);
            }
            DataType::DynBlob(t) => {
                let len_pos = self.slot_for(&t.len_location, RefKind::Length)?;
                self.push(target, Instr::BeginReadDlBlob { data, len_pos });
                self.push(target, Instr::EndReadDlBlob);
            }
            DataType::VariantUIntSel(t) => {
                let sel_pos = self.slot_for(&t.sel_location, RefKind::Selector)?;
                let mut opts = Vec::with_capacity(t.options.len());
                for opt in &t.options {
                    let proc = self.pkt_proc.alloc_proc();
                    self.lower_dt(proc, scope, &opt.data_type, None)?;
                    self.push(proc, Instr::EndReadVar);
                    opts.push(VarOpt {
                        ranges: opt.ranges.clone(),
                        proc,
                    });
                }
                self.push(target, Instr::BeginReadVarUIntSel { data, sel_pos, opts });
            }
            DataType::VariantSIntSel(t) => {
                let sel_pos = self.slot_for(&t.sel_location, RefKind::Selector)?;
                let mut opts = Vec::with_capacity(t.options.len());
                for opt in &t.options {
                    let proc = self.pkt_proc.alloc_proc();
                    self.lower_dt(proc, scope, &opt.data_type, None)?;
                    self.push(proc, Instr::EndReadVar);
                    opts.push(VarOpt {
                        ranges: opt.ranges.clone(),
                        proc,
                    });
                }
                self.push(target, Instr::BeginReadVarSIntSel { data, sel_pos, opts });
            }
            DataType::OptionalBoolSel(t) => {
                let sel_pos = self.slot_for(&t.sel_location, RefKind::Selector)?;
                let body = self.pkt_proc.alloc_proc();
                self.push(
                    target,
                    Instr::BeginReadOptBoolSel {
                        data,
                        sel_pos,
                        proc: body,
                    },
                );
                self.lower_dt(body, scope, &t.body_type, None)?;
                self.push(body, Instr::EndReadOpt);
            }
            DataType::OptionalUIntSel(t) => {
                let sel_pos = self.slot_for(&t.sel_location, RefKind::Selector)?;
                let body = self.pkt_proc.alloc_proc();
                self.push(
                    target,
                    Instr::BeginReadOptUIntSel {
                        data,
                        sel_pos,
                        ranges: t.ranges.clone(),
                        proc: body,
                    },
                );
                self.lower_dt(body, scope, &t.body_type, None)?;
                self.push(body, Instr::EndReadOpt);
            }
            DataType::OptionalSIntSel(t) => {
                let sel_pos = self.slot_for(&t.sel_location, RefKind::Selector)?;
                let body = self.pkt_proc.alloc_proc();
                self.push(
                    target,
                    Instr::BeginReadOptSIntSel {
                        data,
                        sel_pos,
                        ranges: t.ranges.clone(),
                        proc: body,
                    },
                );
                self.lower_dt(body, scope, &t.body_type, None)?;
                self.push(body, Instr::EndReadOpt);
            }
        }
        Ok(())
    }

    fn push_role_instr(&mut self, target: ProcId, role: UnsignedIntegerRole, fl_len: Option<u32>) {
        let instr = match role {
            UnsignedIntegerRole::PacketMagicNumber => Instr::SetPktMagicNumber,
            UnsignedIntegerRole::DataStreamTypeId => {
                self.saw_dst_id_role = true;
                Instr::SetCurId
            }
            UnsignedIntegerRole::EventRecordTypeId => {
                self.saw_ert_id_role = true;
                Instr::SetCurId
            }
            UnsignedIntegerRole::DataStreamId => Instr::SetDsId,
            UnsignedIntegerRole::PacketTotalLength => Instr::SetPktTotalLen,
            UnsignedIntegerRole::PacketContentLength => Instr::SetPktContentLen,
            UnsignedIntegerRole::PacketSequenceNumber => Instr::SetPktSeqNum,
            UnsignedIntegerRole::DiscardedEventRecordCounterSnapshot => {
                Instr::SetPktDiscErCounterSnap
            }
            UnsignedIntegerRole::DefaultClockTimestamp => match fl_len {
                Some(len_bits) => Instr::UpdateDefClkValFl { len_bits },
                None => Instr::UpdateDefClkVal,
            },
            UnsignedIntegerRole::PacketEndDefaultClockTimestamp => Instr::SetPktEndDefClkVal,
        };
        self.push(target, instr);
    }

    fn slot_key(&self, loc: &DataLocation) -> SlotKey {
        let (dst_id, ert_id) = match loc.scope() {
            Scope::PacketHeader => (None, None),
            Scope::PacketContext
            | Scope::EventRecordHeader
            | Scope::EventRecordCommonContext => (self.cur_dst_id, None),
            Scope::EventRecordSpecificContext | Scope::EventRecordPayload => {
                (self.cur_dst_id, self.cur_ert_id)
            }
        };
        (dst_id, ert_id, loc.scope(), loc.path().to_vec())
    }

    /// Saved-value slot of the field at `loc`, allocating it and inserting
    /// the save-value instruction on first reference.
    fn slot_for(&mut self, loc: &DataLocation, kind: RefKind) -> Result<usize, BuildError> {
        let key = self.slot_key(loc);
        if let Some(slot) = self.slots.get(&key) {
            return Ok(*slot);
        }

        let unresolvable = || BuildError::UnresolvableDataLocation {
            location: loc.to_string(),
        };
        let scope_proc = *self.scope_procs.get(&loc.scope()).ok_or_else(unresolvable)?;
        let (pid, idx) = self
            .find_read_instr(scope_proc, loc.path())
            .ok_or_else(unresolvable)?;

        let referent_ok = match (kind, &self.pkt_proc.proc(pid).instrs[idx]) {
            (RefKind::Length, Instr::ReadFlUInt { .. } | Instr::ReadVlUInt { .. }) => true,
            (
                RefKind::Selector,
                Instr::ReadFlUInt { .. }
                | Instr::ReadVlUInt { .. }
                | Instr::ReadFlSInt { .. }
                | Instr::ReadVlSInt { .. }
                | Instr::ReadFlBool { .. },
            ) => true,
            _ => false,
        };
        if !referent_ok {
            return Err(BuildError::InvalidReferentKind {
                location: loc.to_string(),
            });
        }

        let slot = self.next_slot;
        self.next_slot += 1;
        self.pkt_proc
            .proc_mut(pid)
            .instrs
            .insert(idx + 1, Instr::SaveVal { pos: slot });
        self.slots.insert(key, slot);
        Ok(slot)
    }

    /// Locate the read instruction of the member at `path` under the scope
    /// procedure `scope_pid`.
    fn find_read_instr(&self, scope_pid: ProcId, path: &[String]) -> Option<(ProcId, usize)> {
        let root = self
            .pkt_proc
            .proc(scope_pid)
            .instrs
            .iter()
            .find_map(|instr| match instr {
                Instr::BeginReadStruct { proc, .. } => Some(*proc),
                _ => None,
            })?;
        self.find_in_struct(root, path)
    }

    fn find_in_struct(&self, pid: ProcId, path: &[String]) -> Option<(ProcId, usize)> {
        let instrs = &self.pkt_proc.proc(pid).instrs;
        for (i, instr) in instrs.iter().enumerate() {
            if instr.member_name() != Some(path[0].as_str()) {
                continue;
            }
            if path.len() == 1 {
                return Some((pid, i));
            }
            // Only structure members can be traversed further.
            return match instr {
                Instr::BeginReadStruct { proc, .. } => self.find_in_struct(*proc, &path[1..]),
                _ => None,
            };
        }
        None
    }
}

fn fl_spec(
    len_bits: u32,
    align_bits: u32,
    byte_order: ctfstream_metadata::ByteOrder,
    bit_reversed: bool,
) -> FlReadSpec {
    let fast = if !bit_reversed && align_bits >= len_bits {
        match len_bits {
            8 => FlFastPath::A8,
            16 => FlFastPath::A16,
            32 => FlFastPath::A32,
            64 => FlFastPath::A64,
            _ => FlFastPath::None,
        }
    } else {
        FlFastPath::None
    };
    FlReadSpec {
        len_bits,
        byte_order,
        bit_reversed,
        fast,
    }
}
