//! Synthesis of the glue modules that carry adapters at run time.
//!
//! Up to three core modules are emitted:
//!
//! - `weft:adapters` holds one exported function per direct adapter, each
//!   forwarding to its imported lowered target. Direct adapters never touch
//!   memory, so this module depends on nothing but the host instances.
//! - `weft:shim` holds the dispatch state: one funcref table per group, one
//!   pure-dispatch trampoline per table taking a leading i32 index, and one
//!   thin wrapper per member that pushes its constant slot. The shim
//!   imports nothing, so it can be instantiated before every module that
//!   calls through it.
//! - `weft:fixup` closes the loop last: it imports the shim's tables, the
//!   lowered targets, and any designated memories, defines the deferred
//!   transcoding glue, and fills each table with an active element segment.
//!
//! Deferring table contents to the fixup is what makes transcoding sound:
//! glue that marshals through a module's memory cannot be instantiated
//! before that module, but the module's own calls may need to reach the
//! glue. The table breaks the knot. The planner instantiates glue ahead of
//! source modules within a round, so slots are filled before a same-round
//! consumer exists; only a start function in a module the fixup itself
//! waits on could observe an unfilled slot.

use std::borrow::Cow;
use std::collections::HashMap;

use wasm_encoder::{
    BlockType, CodeSection, ConstExpr, ElementSection, Elements, EntityType, ExportKind,
    ExportSection, Function, FunctionSection, ImportSection, Instruction, MemArg, MemoryType,
    Module, RefType, TableSection, TableType, TypeSection, ValType,
};

use crate::adapter::{Adapter, ExportRef, FlatSlot, StringEncoding};
use crate::module::ScalarSig;
use crate::trampoline::{AdapterSite, DedupPlan};

/// Names the synthesized modules appear under in the instantiation plan.
/// The `weft:` prefix keeps them out of the input modules' namespace.
pub const ADAPTERS_MODULE: &str = "weft:adapters";
pub const SHIM_MODULE: &str = "weft:shim";
pub const FIXUP_MODULE: &str = "weft:fixup";

/// The module that exports a given adapter's entry point.
pub fn exporting_module(site: AdapterSite) -> &'static str {
    match site {
        AdapterSite::Direct => ADAPTERS_MODULE,
        AdapterSite::Shared { .. } => SHIM_MODULE,
    }
}

/// Export name of a dispatch table in the shim module.
pub fn table_export_name(table: usize) -> String {
    format!("table-{table}")
}

/// One synthesized module, ready for parsing and planning.
#[derive(Debug, Clone)]
pub struct SynthModule {
    pub name: &'static str,
    pub bytes: Vec<u8>,
}

/// All synthesized glue modules. Empty fields mean the corresponding
/// module had nothing to carry and was not emitted.
#[derive(Debug, Default)]
pub struct SynthOutput {
    pub adapters: Option<SynthModule>,
    pub shim: Option<SynthModule>,
    pub fixup: Option<SynthModule>,
}

impl SynthOutput {
    /// Emitted modules, in the order the planner should see them.
    pub fn modules(&self) -> impl Iterator<Item = &SynthModule> {
        [&self.adapters, &self.shim, &self.fixup]
            .into_iter()
            .flatten()
    }
}

/// Emit every glue module for the given adapters and dedup plan.
pub fn synthesize(adapters: &[Adapter], plan: &DedupPlan) -> SynthOutput {
    SynthOutput {
        adapters: synthesize_adapters(adapters, plan),
        shim: synthesize_shim(adapters, plan),
        fixup: synthesize_fixup(adapters, plan),
    }
}

/// Interns core function types; wasm requires distinct type indices to be
/// referenced, not repeated.
#[derive(Default)]
struct TypeInterner {
    section: TypeSection,
    index: HashMap<(Vec<ValType>, Vec<ValType>), u32>,
}

impl TypeInterner {
    fn intern(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> u32 {
        if let Some(&idx) = self.index.get(&(params.clone(), results.clone())) {
            return idx;
        }
        let idx = self.index.len() as u32;
        self.section.ty().function(params.clone(), results.clone());
        self.index.insert((params, results), idx);
        idx
    }

    fn intern_sig(&mut self, sig: &ScalarSig) -> u32 {
        self.intern(
            sig.params.iter().map(|k| k.to_val_type()).collect(),
            sig.results.iter().map(|k| k.to_val_type()).collect(),
        )
    }

    /// The canonical realloc signature:
    /// (old_ptr, old_size, align, new_size) -> new_ptr.
    fn intern_realloc(&mut self) -> u32 {
        self.intern(vec![ValType::I32; 4], vec![ValType::I32])
    }
}

/// Tracks imported entities while building a synthesized module.
#[derive(Default)]
struct ImportSpace {
    section: ImportSection,
    funcs: u32,
    memories: HashMap<ExportRef, u32>,
    reallocs: HashMap<ExportRef, u32>,
}

impl ImportSpace {
    fn import_func(&mut self, module: &str, field: &str, type_idx: u32) -> u32 {
        let idx = self.funcs;
        self.section
            .import(module, field, EntityType::Function(type_idx));
        self.funcs += 1;
        idx
    }

    /// Import a memory under its owning module's name, once.
    fn import_memory(&mut self, memory: &ExportRef) -> u32 {
        if let Some(&idx) = self.memories.get(memory) {
            return idx;
        }
        let idx = self.memories.len() as u32;
        self.section.import(
            &memory.module,
            &memory.export,
            EntityType::Memory(MemoryType {
                minimum: 0,
                maximum: None,
                memory64: false,
                shared: false,
                page_size_log2: None,
            }),
        );
        self.memories.insert(memory.clone(), idx);
        idx
    }

    fn import_realloc(&mut self, realloc: &ExportRef, type_idx: u32) -> u32 {
        if let Some(&idx) = self.reallocs.get(realloc) {
            return idx;
        }
        let idx = self.import_func(&realloc.module, &realloc.export, type_idx);
        self.reallocs.insert(realloc.clone(), idx);
        idx
    }
}

/// The marshaling context of one glue body.
struct GlueCtx<'a> {
    param_slots: &'a [FlatSlot],
    result_slots: &'a [FlatSlot],
    encoding: StringEncoding,
    memory_index: u32,
    realloc_func: Option<u32>,
}

impl GlueCtx<'_> {
    fn transcodes(&self) -> bool {
        self.encoding != StringEncoding::Utf8
    }

    fn transcodes_params(&self) -> bool {
        self.transcodes()
            && self.param_slots.iter().any(|s| matches!(s, FlatSlot::StringPtr))
    }

    fn transcodes_results(&self) -> bool {
        self.transcodes()
            && self.result_slots.iter().any(|s| matches!(s, FlatSlot::StringPtr))
    }
}

/// Emit a glue function: push (possibly re-encoded) params, call the
/// target, re-encode results if needed.
fn emit_glue(ctx: &GlueCtx<'_>, target: u32) -> Function {
    let param_count = ctx.param_slots.len() as u32;
    let transcode_results = ctx.transcodes_results();
    let any_transcode = ctx.transcodes_params() || transcode_results;

    // Locals after the params: one stash per result slot when results are
    // re-encoded, then two i32 scratch registers (dst, idx) for the copy
    // loops.
    let mut locals: Vec<(u32, ValType)> = Vec::new();
    let stash_base = param_count;
    if transcode_results {
        for slot in ctx.result_slots {
            locals.push((1, slot.kind().to_val_type()));
        }
    }
    let scratch_base = stash_base
        + if transcode_results {
            ctx.result_slots.len() as u32
        } else {
            0
        };
    if any_transcode {
        locals.push((2, ValType::I32));
    }
    let dst_local = scratch_base;
    let idx_local = scratch_base + 1;

    let mut func = Function::new(locals);

    // Params. String pairs re-encode into canonical UTF-8; everything else
    // forwards untouched.
    let mut i = 0;
    while i < ctx.param_slots.len() {
        let local = i as u32;
        match ctx.param_slots[i] {
            FlatSlot::StringPtr if ctx.transcodes() => {
                emit_transcode(
                    &mut func,
                    ctx,
                    local,
                    local + 1,
                    dst_local,
                    idx_local,
                    ctx.encoding.unit_size(),
                    1,
                );
                i += 2; // consumed the length slot too
            }
            _ => {
                func.instruction(&Instruction::LocalGet(local));
                i += 1;
            }
        }
    }

    func.instruction(&Instruction::Call(target));

    if transcode_results {
        // Stash results so string pairs can be re-encoded; pop order is the
        // reverse of the value order.
        for (i, _) in ctx.result_slots.iter().enumerate().rev() {
            func.instruction(&Instruction::LocalSet(stash_base + i as u32));
        }
        let mut i = 0;
        while i < ctx.result_slots.len() {
            let local = stash_base + i as u32;
            match ctx.result_slots[i] {
                FlatSlot::StringPtr => {
                    emit_transcode(
                        &mut func,
                        ctx,
                        local,
                        local + 1,
                        dst_local,
                        idx_local,
                        1,
                        ctx.encoding.unit_size(),
                    );
                    i += 2;
                }
                _ => {
                    func.instruction(&Instruction::LocalGet(local));
                    i += 1;
                }
            }
        }
    }

    func.instruction(&Instruction::End);
    func
}

/// Re-encode a string through scratch space: allocate `len * dst_unit`
/// bytes via realloc, copy code unit by code unit, and leave the new
/// (ptr, len) pair on the stack.
///
/// Units are copied one-to-one, which is exact for Latin-1 and for the
/// ASCII subset of UTF-8/UTF-16.
/// TODO: surrogate-aware UTF-16 <-> multi-byte UTF-8 conversion; requires a
/// variable-length output cursor instead of the unit-indexed store below.
#[allow(clippy::too_many_arguments)]
fn emit_transcode(
    func: &mut Function,
    ctx: &GlueCtx<'_>,
    src_local: u32,
    len_local: u32,
    dst_local: u32,
    idx_local: u32,
    src_unit: u32,
    dst_unit: u32,
) {
    let realloc = ctx
        .realloc_func
        .expect("transcoding glue always has a realloc import");
    let memarg = |align: u32| MemArg {
        offset: 0,
        align,
        memory_index: ctx.memory_index,
    };
    let scale = |func: &mut Function, unit: u32| {
        if unit > 1 {
            func.instruction(&Instruction::I32Const(unit as i32));
            func.instruction(&Instruction::I32Mul);
        }
    };

    // dst = realloc(0, 0, dst_unit, len * dst_unit)
    func.instruction(&Instruction::I32Const(0));
    func.instruction(&Instruction::I32Const(0));
    func.instruction(&Instruction::I32Const(dst_unit as i32));
    func.instruction(&Instruction::LocalGet(len_local));
    scale(func, dst_unit);
    func.instruction(&Instruction::Call(realloc));
    func.instruction(&Instruction::LocalSet(dst_local));

    // for idx in 0..len { dst[idx] = src[idx] }
    func.instruction(&Instruction::I32Const(0));
    func.instruction(&Instruction::LocalSet(idx_local));
    func.instruction(&Instruction::Block(BlockType::Empty));
    func.instruction(&Instruction::Loop(BlockType::Empty));
    func.instruction(&Instruction::LocalGet(idx_local));
    func.instruction(&Instruction::LocalGet(len_local));
    func.instruction(&Instruction::I32GeU);
    func.instruction(&Instruction::BrIf(1));
    func.instruction(&Instruction::LocalGet(dst_local));
    func.instruction(&Instruction::LocalGet(idx_local));
    scale(func, dst_unit);
    func.instruction(&Instruction::I32Add);
    func.instruction(&Instruction::LocalGet(src_local));
    func.instruction(&Instruction::LocalGet(idx_local));
    scale(func, src_unit);
    func.instruction(&Instruction::I32Add);
    if src_unit == 1 {
        func.instruction(&Instruction::I32Load8U(memarg(0)));
    } else {
        func.instruction(&Instruction::I32Load16U(memarg(1)));
    }
    if dst_unit == 1 {
        func.instruction(&Instruction::I32Store8(memarg(0)));
    } else {
        func.instruction(&Instruction::I32Store16(memarg(1)));
    }
    func.instruction(&Instruction::LocalGet(idx_local));
    func.instruction(&Instruction::I32Const(1));
    func.instruction(&Instruction::I32Add);
    func.instruction(&Instruction::LocalSet(idx_local));
    func.instruction(&Instruction::Br(0));
    func.instruction(&Instruction::End);
    func.instruction(&Instruction::End);

    // The transcoded pair. Unit counts are preserved, so the length
    // carries over.
    func.instruction(&Instruction::LocalGet(dst_local));
    func.instruction(&Instruction::LocalGet(len_local));
}

/// Direct adapters: trivial forwarders. Deduplication guarantees anything
/// needing memory was deferred behind a table, so no memory is imported
/// here and the module depends only on host instances.
fn synthesize_adapters(adapters: &[Adapter], plan: &DedupPlan) -> Option<SynthModule> {
    let direct: Vec<usize> = plan.direct().collect();
    if direct.is_empty() {
        return None;
    }

    let mut types = TypeInterner::default();
    let mut imports = ImportSpace::default();

    let mut targets = Vec::with_capacity(direct.len());
    for &index in &direct {
        let adapter = &adapters[index];
        let type_idx = types.intern_sig(&adapter.signature);
        targets.push(imports.import_func(&adapter.instance, &adapter.func, type_idx));
    }

    let mut functions = FunctionSection::new();
    let mut exports = ExportSection::new();
    let mut code = CodeSection::new();
    for (pos, &index) in direct.iter().enumerate() {
        let adapter = &adapters[index];
        let type_idx = types.intern_sig(&adapter.signature);
        functions.function(type_idx);

        let ctx = GlueCtx {
            param_slots: &adapter.param_slots,
            result_slots: &adapter.result_slots,
            encoding: adapter.options.string_encoding,
            memory_index: 0,
            realloc_func: None,
        };
        code.function(&emit_glue(&ctx, targets[pos]));

        exports.export(&adapter.name, ExportKind::Func, imports.funcs + pos as u32);
    }

    let mut module = Module::new();
    module.section(&types.section);
    module.section(&imports.section);
    module.section(&functions);
    module.section(&exports);
    module.section(&code);
    Some(SynthModule {
        name: ADAPTERS_MODULE,
        bytes: module.finish(),
    })
}

/// The shim: tables, pure-dispatch trampolines, and wrapper stubs. No
/// imports of any kind; the fixup fills the tables later.
fn synthesize_shim(adapters: &[Adapter], plan: &DedupPlan) -> Option<SynthModule> {
    if plan.tables.is_empty() {
        return None;
    }

    let mut types = TypeInterner::default();
    let mut tables = TableSection::new();
    let mut functions = FunctionSection::new();
    let mut exports = ExportSection::new();
    let mut code = CodeSection::new();

    // Function index space: trampolines first, then wrappers.
    let trampoline_index = |g: usize| g as u32;
    let mut wrapper_index = plan.tables.len() as u32;

    for (g, table) in plan.tables.iter().enumerate() {
        let size = table.members.len() as u64;
        tables.table(TableType {
            element_type: RefType::FUNCREF,
            minimum: size,
            maximum: Some(size),
            table64: false,
            shared: false,
        });
        exports.export(&table_export_name(g), ExportKind::Table, g as u32);

        let target_ty = types.intern_sig(&table.signature);

        // Trampoline: leading index param, dispatch through this table.
        let mut params = vec![ValType::I32];
        params.extend(table.signature.params.iter().map(|k| k.to_val_type()));
        let results: Vec<ValType> =
            table.signature.results.iter().map(|k| k.to_val_type()).collect();
        let trampoline_ty = types.intern(params, results);
        functions.function(trampoline_ty);

        let mut body = Function::new([]);
        for p in 0..table.signature.params.len() as u32 {
            body.instruction(&Instruction::LocalGet(1 + p));
        }
        body.instruction(&Instruction::LocalGet(0));
        body.instruction(&Instruction::CallIndirect {
            type_index: target_ty,
            table_index: g as u32,
        });
        body.instruction(&Instruction::End);
        code.function(&body);
    }

    // Wrappers: push the constant slot, forward the params verbatim.
    for (g, table) in plan.tables.iter().enumerate() {
        let wrapper_ty = types.intern_sig(&table.signature);
        for (slot, &member) in table.members.iter().enumerate() {
            functions.function(wrapper_ty);
            let mut func = Function::new([]);
            func.instruction(&Instruction::I32Const(slot as i32));
            for p in 0..table.signature.params.len() as u32 {
                func.instruction(&Instruction::LocalGet(p));
            }
            func.instruction(&Instruction::Call(trampoline_index(g)));
            func.instruction(&Instruction::End);
            code.function(&func);

            exports.export(&adapters[member].name, ExportKind::Func, wrapper_index);
            wrapper_index += 1;
        }
    }

    let mut module = Module::new();
    module.section(&types.section);
    module.section(&functions);
    module.section(&tables);
    module.section(&exports);
    module.section(&code);
    Some(SynthModule {
        name: SHIM_MODULE,
        bytes: module.finish(),
    })
}

/// The fixup: instantiated last, once every target and memory is live. It
/// defines the deferred transcoding glue and fills every dispatch table.
fn synthesize_fixup(adapters: &[Adapter], plan: &DedupPlan) -> Option<SynthModule> {
    if plan.tables.is_empty() {
        return None;
    }

    let mut types = TypeInterner::default();
    let mut imports = ImportSpace::default();

    for (g, table) in plan.tables.iter().enumerate() {
        let size = table.members.len() as u64;
        imports.section.import(
            SHIM_MODULE,
            &table_export_name(g),
            EntityType::Table(TableType {
                element_type: RefType::FUNCREF,
                minimum: size,
                maximum: Some(size),
                table64: false,
                shared: false,
            }),
        );
    }

    // Import pass: every member's lowered target, and for transcoding
    // members the designated memory and realloc.
    struct MemberSlot {
        target: u32,
        glue: Option<(u32, u32)>, // (memory index, realloc func)
    }
    let mut members: Vec<Vec<MemberSlot>> = Vec::with_capacity(plan.tables.len());
    for table in &plan.tables {
        let mut slots = Vec::with_capacity(table.members.len());
        for &member in &table.members {
            let adapter = &adapters[member];
            let type_idx = types.intern_sig(&adapter.signature);
            let target = imports.import_func(&adapter.instance, &adapter.func, type_idx);
            let glue = if adapter.transcodes() {
                let memory = adapter.options.memory.as_ref().expect("checked at lowering");
                let realloc = adapter.options.realloc.as_ref().expect("checked at lowering");
                let realloc_ty = types.intern_realloc();
                let memory_index = imports.import_memory(memory);
                let realloc_func = imports.import_realloc(realloc, realloc_ty);
                Some((memory_index, realloc_func))
            } else {
                None
            };
            slots.push(MemberSlot { target, glue });
        }
        members.push(slots);
    }

    // Defined glue bodies for transcoding members; table slots point at
    // these, pass-through slots point straight at the imported target.
    let mut functions = FunctionSection::new();
    let mut code = CodeSection::new();
    let mut next_defined = imports.funcs;
    let mut segments: Vec<Vec<u32>> = Vec::with_capacity(plan.tables.len());
    for (g, table) in plan.tables.iter().enumerate() {
        let mut items = Vec::with_capacity(table.members.len());
        for (slot, &member) in table.members.iter().enumerate() {
            let adapter = &adapters[member];
            match members[g][slot].glue {
                Some((memory_index, realloc_func)) => {
                    functions.function(types.intern_sig(&adapter.signature));
                    let ctx = GlueCtx {
                        param_slots: &adapter.param_slots,
                        result_slots: &adapter.result_slots,
                        encoding: adapter.options.string_encoding,
                        memory_index,
                        realloc_func: Some(realloc_func),
                    };
                    code.function(&emit_glue(&ctx, members[g][slot].target));
                    items.push(next_defined);
                    next_defined += 1;
                }
                None => items.push(members[g][slot].target),
            }
        }
        segments.push(items);
    }

    let mut elements = ElementSection::new();
    let offset = ConstExpr::i32_const(0);
    for (g, items) in segments.iter().enumerate() {
        elements.active(
            Some(g as u32),
            &offset,
            Elements::Functions(Cow::Borrowed(items.as_slice())),
        );
    }

    let has_code = next_defined > imports.funcs;
    let mut module = Module::new();
    module.section(&types.section);
    module.section(&imports.section);
    if has_code {
        module.section(&functions);
    }
    module.section(&elements);
    if has_code {
        module.section(&code);
    }
    Some(SynthModule {
        name: FIXUP_MODULE,
        bytes: module.finish(),
    })
}
