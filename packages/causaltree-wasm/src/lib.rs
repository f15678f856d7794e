#![forbid(unsafe_code)]
//! WASM-friendly bridge for causal tree replicas.
//! Exposes a small wasm-bindgen surface so a browser client runs the same weave and
//! reducer as the replicator. Atoms and ops cross the boundary as JSON strings.

use causaltree_core::{
    AppOp, Atom, AtomId, CausalTree, ContentHash, LamportClock, Reducer, SiteId, StateDiff,
};
use serde::Serialize;
use serde_wasm_bindgen::to_value;
use wasm_bindgen::prelude::*;

fn hex_to_bytes(text: &str) -> Result<Vec<u8>, String> {
    hex::decode(text.trim_start_matches("0x")).map_err(|e| e.to_string())
}

fn js_err(e: impl ToString) -> JsValue {
    JsValue::from_str(&e.to_string())
}

/// Summary returned to JS after atoms are applied.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApplyResult {
    applied: Vec<ContentHash>,
    pending: usize,
    diff: StateDiff,
}

/// One replica: weave, Lamport clock and incrementally reduced state.
#[wasm_bindgen]
pub struct WasmWeave {
    tree: CausalTree<AppOp, LamportClock>,
    reducer: Reducer,
}

impl WasmWeave {
    fn cause_id(&self, cause_hex: Option<String>) -> Result<Option<AtomId>, String> {
        let Some(hex) = cause_hex else {
            return Ok(None);
        };
        let hash = ContentHash::from_hex(&hex).map_err(|e| e.to_string())?;
        self.tree
            .weave()
            .find_by_hash(&hash)
            .map(|atom| Some(atom.id.clone()))
            .ok_or_else(|| format!("unknown cause {hash}"))
    }

    fn reduce(&mut self) -> StateDiff {
        self.reducer.apply(self.tree.weave())
    }
}

#[wasm_bindgen]
impl WasmWeave {
    /// `site_hex` falls back to the bytes `wasm` when it is not valid hex.
    #[wasm_bindgen(constructor)]
    pub fn new(site_hex: String) -> WasmWeave {
        let site = hex_to_bytes(&site_hex).unwrap_or_else(|_| b"wasm".to_vec());
        WasmWeave {
            tree: CausalTree::new(SiteId::new(site), LamportClock::default()),
            reducer: Reducer::new(),
        }
    }

    /// Apply remote atoms (a JSON array). Atoms with a bad checksum are rejected
    /// before anything is applied.
    #[wasm_bindgen(js_name = addAtoms)]
    pub fn add_atoms(&mut self, atoms_json: String) -> Result<JsValue, JsValue> {
        let atoms: Vec<Atom<AppOp>> = serde_json::from_str(&atoms_json).map_err(js_err)?;
        if let Some(bad) = atoms.iter().find(|a| !a.is_valid()) {
            return Err(js_err(format!("checksum mismatch for atom {}", bad.id)));
        }
        let mut applied = Vec::new();
        for atom in atoms {
            let report = self.tree.apply_remote(atom).map_err(js_err)?;
            applied.extend(report.applied.iter().map(Atom::hash));
        }
        let result = ApplyResult {
            applied,
            pending: self.tree.weave().pending_len(),
            diff: self.reduce(),
        };
        to_value(&result).map_err(js_err)
    }

    /// Remove atoms (a JSON array of hashes) with their subtrees. Returns the state diff.
    #[wasm_bindgen(js_name = removeAtoms)]
    pub fn remove_atoms(&mut self, hashes_json: String) -> Result<JsValue, JsValue> {
        let hashes: Vec<ContentHash> = serde_json::from_str(&hashes_json).map_err(js_err)?;
        for hash in hashes {
            let Some(id) = self.tree.weave().find_by_hash(&hash).map(|a| a.id.clone()) else {
                continue;
            };
            self.tree.remove(&id).map_err(js_err)?;
        }
        to_value(&self.reduce()).map_err(js_err)
    }

    /// Create a local atom under `cause_hex` (or as a root) and return it as JSON for
    /// the replicator.
    #[wasm_bindgen(js_name = localAtom)]
    pub fn local_atom(&mut self, cause_hex: Option<String>, op_json: String) -> Result<String, JsValue> {
        let op: AppOp = serde_json::from_str(&op_json).map_err(js_err)?;
        let cause = self.cause_id(cause_hex).map_err(js_err)?;
        let atom = self.tree.local(cause.as_ref(), op).map_err(js_err)?;
        self.reduce();
        serde_json::to_string(&atom).map_err(js_err)
    }

    pub fn state(&self) -> Result<JsValue, JsValue> {
        to_value(self.reducer.state()).map_err(js_err)
    }

    /// Woven atoms in weave order, as JSON.
    pub fn atoms(&self) -> Result<String, JsValue> {
        serde_json::to_string(self.tree.weave().atoms()).map_err(js_err)
    }

    #[wasm_bindgen(js_name = atomCount)]
    pub fn atom_count(&self) -> u32 {
        self.tree.weave().len() as u32
    }

    #[wasm_bindgen(js_name = pendingCount)]
    pub fn pending_count(&self) -> u32 {
        self.tree.weave().pending_len() as u32
    }

    pub fn lamport(&self) -> u64 {
        self.tree.lamport()
    }
}
