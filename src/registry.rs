// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data model and the tool registry (C7).
//!
//! Cyclic references (`Tool` <-> port map <-> registry) are broken by
//! indexing: [`ToolRegistry`] owns all `Tool` storage in an arena (`Vec`),
//! and the port-handle map holds plain indices rather than references.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::RegistryError;

/// A rigid 3-D pose: unit quaternion (scalar-first, w,x,y,z) plus
/// translation in millimetres, with a validity flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub rotation: [f64; 4],
    pub translation: [f64; 3],
    pub valid: bool,
}

impl Pose {
    pub const IDENTITY: Self = Self {
        rotation: [1.0, 0.0, 0.0, 0.0],
        translation: [0.0, 0.0, 0.0],
        valid: false,
    };

    /// Normalize the quaternion component to unit length. A no-op (up to
    /// float epsilon) when already normalized.
    pub fn normalized(mut self) -> Self {
        let [w, x, y, z] = self.rotation;
        let norm = (w * w + x * x + y * y + z * z).sqrt();
        if norm > f64::EPSILON {
            self.rotation = [w / norm, x / norm, y / norm, z / norm];
        }
        self
    }

    /// Build the 3x3 rotation matrix for this pose's quaternion (row-major).
    pub fn rotation_matrix(&self) -> [[f64; 3]; 3] {
        let [w, x, y, z] = self.rotation;
        [
            [
                1.0 - 2.0 * (y * y + z * z),
                2.0 * (x * y - w * z),
                2.0 * (x * z + w * y),
            ],
            [
                2.0 * (x * y + w * z),
                1.0 - 2.0 * (x * x + z * z),
                2.0 * (y * z - w * x),
            ],
            [
                2.0 * (x * z - w * y),
                2.0 * (y * z + w * x),
                1.0 - 2.0 * (x * x + y * y),
            ],
        ]
    }

    /// Rotate a vector by this pose's quaternion.
    pub fn rotate_vector(&self, v: [f64; 3]) -> [f64; 3] {
        let r = self.rotation_matrix();
        [
            r[0][0] * v[0] + r[0][1] * v[1] + r[0][2] * v[2],
            r[1][0] * v[0] + r[1][1] * v[1] + r[1][2] * v[2],
            r[2][0] * v[0] + r[2][1] * v[1] + r[2][2] * v[2],
        ]
    }

    /// Compose this pose with a local-frame translation offset applied
    /// after rotation: `t' = t + R * offset`.
    pub fn with_offset(&self, offset: [f64; 3]) -> Self {
        let rotated = self.rotate_vector(offset);
        Self {
            rotation: self.rotation,
            translation: [
                self.translation[0] + rotated[0],
                self.translation[1] + rotated[1],
                self.translation[2] + rotated[2],
            ],
            valid: self.valid,
        }
    }
}

/// A tracked object: identity plus live pose.
#[derive(Debug, Clone)]
pub struct Tool {
    pub name: String,
    pub serial_number: String,
    pub definition_path: Option<PathBuf>,
    pub port_handle: String,
    pub main_type: String,
    pub manufacturer_id: String,
    pub tool_revision: String,
    pub part_number: String,
    pub tooltip_offset: [f64; 3],
    pub tooltip_pose: Pose,
    pub marker_pose: Pose,
    pub error_rms: f64,
    pub frame_number: u32,
}

impl Tool {
    fn new(name: &str, serial_number: &str, definition_path: Option<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            serial_number: serial_number.to_string(),
            definition_path,
            port_handle: String::new(),
            main_type: String::new(),
            manufacturer_id: String::new(),
            tool_revision: String::new(),
            part_number: String::new(),
            tooltip_offset: [0.0; 3],
            tooltip_pose: Pose::IDENTITY,
            marker_pose: Pose::IDENTITY,
            error_rms: 0.0,
            frame_number: 0,
        }
    }
}

/// Fixed-size stray marker table: 50 rows x [occupied, in_volume, x, y, z].
/// Rows beyond the reported count are always zero.
#[derive(Debug, Clone, Copy)]
pub struct StrayMarkerTable {
    rows: [[f64; 5]; Self::CAPACITY],
}

impl StrayMarkerTable {
    pub const CAPACITY: usize = 50;

    pub fn empty() -> Self {
        Self {
            rows: [[0.0; 5]; Self::CAPACITY],
        }
    }

    pub fn row(&self, i: usize) -> [f64; 5] {
        self.rows[i]
    }

    pub fn set_row(&mut self, i: usize, occupied: bool, in_volume: bool, xyz: [f64; 3]) {
        self.rows[i] = [
            if occupied { 1.0 } else { 0.0 },
            if in_volume { 1.0 } else { 0.0 },
            xyz[0],
            xyz[1],
            xyz[2],
        ];
    }

    pub fn clear(&mut self) {
        self.rows = [[0.0; 5]; Self::CAPACITY];
    }
}

impl Default for StrayMarkerTable {
    fn default() -> Self {
        Self::empty()
    }
}

/// Stable index into [`ToolRegistry`]'s arena.
pub type ToolId = usize;

/// Owns all `Tool` storage; the port-handle map holds non-owning indices.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
    name_index: HashMap<String, ToolId>,
    serial_index: HashMap<String, ToolId>,
    port_index: HashMap<String, ToolId>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool. If `serial` already exists, the existing tool is
    /// returned unchanged. Otherwise a new
    /// `Tool` is created under `name`; a name collision with a *different*
    /// serial number fails with [`RegistryError::DuplicateName`].
    pub fn add_tool(
        &mut self,
        name: &str,
        serial: &str,
        definition_path: Option<PathBuf>,
    ) -> Result<ToolId, RegistryError> {
        if let Some(&id) = self.serial_index.get(serial) {
            return Ok(id);
        }
        if self.name_index.contains_key(name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        let id = self.tools.len();
        self.tools.push(Tool::new(name, serial, definition_path));
        self.name_index.insert(name.to_string(), id);
        self.serial_index.insert(serial.to_string(), id);
        Ok(id)
    }

    pub fn get(&self, id: ToolId) -> Option<&Tool> {
        self.tools.get(id)
    }

    pub fn get_mut(&mut self, id: ToolId) -> Option<&mut Tool> {
        self.tools.get_mut(id)
    }

    pub fn tool_by_serial(&self, serial: &str) -> Option<ToolId> {
        self.serial_index.get(serial).copied()
    }

    pub fn tool_by_port_handle(&self, port_handle: &str) -> Option<ToolId> {
        self.port_index.get(port_handle).copied()
    }

    pub fn tool_name_at_index(&self, i: usize) -> Option<&str> {
        self.tools.get(i).map(|t| t.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tool> {
        self.tools.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Tool> {
        self.tools.iter_mut()
    }

    /// Associate `port_handle` with `id`, replacing any prior mapping this
    /// tool held (e.g. after a free/re-enable cycle).
    pub fn assign_port_handle(&mut self, id: ToolId, port_handle: &str) {
        if let Some(tool) = self.tools.get(id) {
            let old = tool.port_handle.clone();
            if !old.is_empty() {
                self.port_index.remove(&old);
            }
        }
        self.port_index.insert(port_handle.to_string(), id);
        if let Some(tool) = self.tools.get_mut(id) {
            tool.port_handle = port_handle.to_string();
        }
    }

    /// Clear a tool's port-handle association.
    pub fn clear_port_handle(&mut self, id: ToolId) {
        if let Some(tool) = self.tools.get_mut(id) {
            if !tool.port_handle.is_empty() {
                self.port_index.remove(&tool.port_handle);
                tool.port_handle.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_tool_is_idempotent_on_duplicate_serial() {
        let mut reg = ToolRegistry::new();
        let id1 = reg.add_tool("probe", "12345678", None).unwrap();
        let id2 = reg.add_tool("probe-again", "12345678", None).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(id1).unwrap().name, "probe");
    }

    #[test]
    fn add_tool_rejects_name_collision_with_different_serial() {
        let mut reg = ToolRegistry::new();
        reg.add_tool("probe", "12345678", None).unwrap();
        let err = reg.add_tool("probe", "87654321", None).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateName("probe".into()));
    }

    #[test]
    fn port_handle_lookup_round_trips() {
        let mut reg = ToolRegistry::new();
        let id = reg.add_tool("probe", "12345678", None).unwrap();
        reg.assign_port_handle(id, "01");
        assert_eq!(reg.tool_by_port_handle("01"), Some(id));
        assert_eq!(reg.get(id).unwrap().port_handle, "01");
    }

    #[test]
    fn clear_port_handle_removes_mapping() {
        let mut reg = ToolRegistry::new();
        let id = reg.add_tool("probe", "12345678", None).unwrap();
        reg.assign_port_handle(id, "01");
        reg.clear_port_handle(id);
        assert_eq!(reg.tool_by_port_handle("01"), None);
        assert_eq!(reg.get(id).unwrap().port_handle, "");
    }

    #[test]
    fn identity_pose_rotation_leaves_vector_unchanged() {
        let pose = Pose::IDENTITY;
        let v = [1.0, 2.0, 3.0];
        let rotated = pose.rotate_vector(v);
        for i in 0..3 {
            assert!((rotated[i] - v[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn with_offset_adds_rotated_offset_to_translation() {
        let pose = Pose {
            rotation: [1.0, 0.0, 0.0, 0.0],
            translation: [100.0, 0.0, 0.0],
            valid: true,
        };
        let tip = pose.with_offset([0.0, 0.0, 5.0]);
        assert_eq!(tip.translation, [100.0, 0.0, 5.0]);
    }

    #[test]
    fn normalize_is_idempotent() {
        let pose = Pose {
            rotation: [2.0, 0.0, 0.0, 0.0],
            translation: [0.0; 3],
            valid: true,
        }
        .normalized();
        let twice = pose.normalized();
        for i in 0..4 {
            assert!((pose.rotation[i] - twice.rotation[i]).abs() < 1e-12);
        }
        let norm: f64 = pose.rotation.iter().map(|c| c * c).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9);
    }

    #[test]
    fn stray_marker_table_unset_rows_are_zero() {
        let mut table = StrayMarkerTable::empty();
        table.set_row(0, true, false, [1.0, 2.0, 3.0]);
        assert_eq!(table.row(0), [1.0, 0.0, 1.0, 2.0, 3.0]);
        assert_eq!(table.row(1), [0.0; 5]);
        assert_eq!(table.row(49), [0.0; 5]);
    }
}
