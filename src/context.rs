//! Draw scopes: the RenderingContext -> Pipeline -> ShaderObject -> Mesh
//! hierarchy flattened into the frame's composite command buffer.
//!
//! Each level owns its children in a generational arena guarded by its own
//! mutex; there is no global lock. `add_*` issues a fresh UID from the
//! parent's private stream and returns a `(slot, generation, uid)` handle.
//! Removal vacates the slot and bumps its generation, so a handle held
//! past removal is detectably stale: `remove_*` reports `false` instead of
//! touching another child's storage.
//!
//! GPU handles stored here (pipelines, descriptor sets, buffers) are
//! borrowed references; creating and destroying them is the resource
//! layer's job. The hierarchy only orders and groups them for drawing.
//!
//! Callers must not mutate a context that the render step is concurrently
//! flattening; each level's mutex is held only while that level is
//! iterated.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::uid::UidStream;

/// Upper bound on contexts registered for a single frame.
pub const MAX_ACTIVE_RENDERING_CONTEXTS: usize = 512;

// ============================================================================
// Generational arena
// ============================================================================

/// Handle to a child in its parent's arena.
///
/// Carries the child's UID alongside the slot coordinates; the UID is the
/// child's identity, the `(index, generation)` pair is how the parent
/// finds it after the backing storage has grown or the slot was recycled.
pub struct Handle<T> {
    index: u32,
    generation: u32,
    uid: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// The process-unique identifier issued when the child was added.
    #[inline]
    pub fn uid(&self) -> u64 {
        self.uid
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation && self.uid == other.uid
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .field("uid", &format_args!("{:#018x}", self.uid))
            .finish()
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn insert(&mut self, uid: u64, value: T) -> Handle<T> {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            Handle {
                index,
                generation: slot.generation,
                uid,
                _marker: PhantomData,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                value: Some(value),
            });
            Handle {
                index,
                generation: 0,
                uid,
                _marker: PhantomData,
            }
        }
    }

    pub(crate) fn get(&self, handle: Handle<T>) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.value.as_ref()
    }

    pub(crate) fn remove(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation || slot.value.is_none() {
            return None;
        }
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        value
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|slot| slot.value.as_ref())
    }
}

// ============================================================================
// Attachments
// ============================================================================

/// Plain attachment description for a dynamic-rendering pass.
///
/// Mirrors `VkRenderingAttachmentInfo` minus the pointer chain so scopes
/// can cross threads; converted at record time.
#[derive(Clone, Copy)]
pub struct Attachment {
    pub image_view: vk::ImageView,
    pub image_layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear_value: vk::ClearValue,
}

impl Attachment {
    /// Color attachment cleared to `color` at load, stored at the end.
    pub fn clear_color(image_view: vk::ImageView, color: [f32; 4]) -> Self {
        Self {
            image_view,
            image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear_value: vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            },
        }
    }

    /// Depth attachment cleared to `depth` at load, discarded at the end.
    pub fn clear_depth(image_view: vk::ImageView, depth: f32) -> Self {
        Self {
            image_view,
            image_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            clear_value: vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth,
                    stencil: 0,
                },
            },
        }
    }

    fn to_vk(&self) -> vk::RenderingAttachmentInfo {
        vk::RenderingAttachmentInfo::builder()
            .image_view(self.image_view)
            .image_layout(self.image_layout)
            .resolve_mode(vk::ResolveModeFlags::NONE)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .clear_value(self.clear_value)
            .build()
    }
}

// ============================================================================
// Hierarchy nodes
// ============================================================================

/// Leaf node: geometry buffer bindings. Identity is by UID; buffer
/// contents never participate in equality.
pub struct Mesh {
    uid: u64,
    vertex_buffers: Vec<vk::Buffer>,
    vertex_offsets: Vec<vk::DeviceSize>,
    index_buffer: vk::Buffer,
}

impl Mesh {
    #[inline]
    pub fn uid(&self) -> u64 {
        self.uid
    }
}

impl PartialEq for Mesh {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

pub struct ShaderObject {
    uid: u64,
    descriptor_sets: Vec<vk::DescriptorSet>,
    meshes: Mutex<Arena<Mesh>>,
    mesh_uids: UidStream,
}

impl ShaderObject {
    #[inline]
    pub fn uid(&self) -> u64 {
        self.uid
    }
}

impl PartialEq for ShaderObject {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

pub struct Pipeline {
    uid: u64,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    shader_objects: Mutex<Arena<ShaderObject>>,
    shader_object_uids: UidStream,
}

impl Pipeline {
    #[inline]
    pub fn uid(&self) -> u64 {
        self.uid
    }
}

impl PartialEq for Pipeline {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
    }
}

pub type PipelineHandle = Handle<Pipeline>;
pub type ShaderObjectHandle = Handle<ShaderObject>;
pub type MeshHandle = Handle<Mesh>;

/// An application-defined draw scope: target attachments plus the tree of
/// pipelines, shader objects and meshes drawn into them.
///
/// Contexts are registered into the backend's active list before each
/// render step and must be re-registered every frame; the active list is
/// cleared after each flattening pass.
pub struct RenderingContext {
    render_area: vk::Rect2D,
    color_attachments: Vec<Attachment>,
    depth_attachment: Option<Attachment>,
    stencil_attachment: Option<Attachment>,
    pipelines: Mutex<Arena<Pipeline>>,
    pipeline_uids: UidStream,
}

impl RenderingContext {
    pub fn new(
        render_area: vk::Rect2D,
        color_attachments: Vec<Attachment>,
        depth_attachment: Option<Attachment>,
        stencil_attachment: Option<Attachment>,
    ) -> Self {
        Self {
            render_area,
            color_attachments,
            depth_attachment,
            stencil_attachment,
            pipelines: Mutex::new(Arena::new()),
            pipeline_uids: UidStream::new(),
        }
    }

    /// Like [`RenderingContext::new`], with an explicit UID seed.
    ///
    /// Child containers derive their streams from the parent's, so one
    /// seed makes every UID in the tree reproducible.
    pub fn with_uid_seed(
        seed: u64,
        render_area: vk::Rect2D,
        color_attachments: Vec<Attachment>,
        depth_attachment: Option<Attachment>,
        stencil_attachment: Option<Attachment>,
    ) -> Self {
        Self {
            render_area,
            color_attachments,
            depth_attachment,
            stencil_attachment,
            pipelines: Mutex::new(Arena::new()),
            pipeline_uids: UidStream::with_seed(seed),
        }
    }

    #[inline]
    pub fn render_area(&self) -> vk::Rect2D {
        self.render_area
    }

    pub fn add_pipeline(
        &self,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
    ) -> PipelineHandle {
        let uid = self.pipeline_uids.next();
        let child_seed = self.pipeline_uids.next();
        self.pipelines.lock().insert(
            uid,
            Pipeline {
                uid,
                pipeline,
                layout,
                shader_objects: Mutex::new(Arena::new()),
                shader_object_uids: UidStream::with_seed(child_seed),
            },
        )
    }

    /// Removes a pipeline and everything under it. `false` means the
    /// handle was stale (already removed, or never of this context).
    pub fn remove_pipeline(&self, handle: PipelineHandle) -> bool {
        if self.pipelines.lock().remove(handle).is_none() {
            log::error!(
                "failed to remove pipeline {:#x}; may indicate a stale pipeline handle",
                handle.uid()
            );
            return false;
        }
        true
    }

    pub fn add_shader_object(
        &self,
        pipeline: PipelineHandle,
        descriptor_sets: &[vk::DescriptorSet],
    ) -> Option<ShaderObjectHandle> {
        let pipelines = self.pipelines.lock();
        let Some(parent) = pipelines.get(pipeline) else {
            log::error!(
                "failed to add shader object under pipeline {:#x}; may indicate a stale pipeline handle",
                pipeline.uid()
            );
            return None;
        };
        let uid = parent.shader_object_uids.next();
        let child_seed = parent.shader_object_uids.next();
        let result = parent.shader_objects.lock().insert(
            uid,
            ShaderObject {
                uid,
                descriptor_sets: descriptor_sets.to_vec(),
                meshes: Mutex::new(Arena::new()),
                mesh_uids: UidStream::with_seed(child_seed),
            },
        );
        Some(result)
    }

    pub fn remove_shader_object(
        &self,
        pipeline: PipelineHandle,
        handle: ShaderObjectHandle,
    ) -> bool {
        let pipelines = self.pipelines.lock();
        let Some(parent) = pipelines.get(pipeline) else {
            log::error!(
                "failed to remove shader object {:#x}; may indicate a stale pipeline handle",
                handle.uid()
            );
            return false;
        };
        if parent.shader_objects.lock().remove(handle).is_none() {
            log::error!(
                "failed to remove shader object {:#x}; may indicate a stale shader object handle",
                handle.uid()
            );
            return false;
        }
        true
    }

    pub fn add_mesh(
        &self,
        pipeline: PipelineHandle,
        shader_object: ShaderObjectHandle,
        vertex_buffers: &[vk::Buffer],
        vertex_offsets: &[vk::DeviceSize],
        index_buffer: vk::Buffer,
    ) -> Option<MeshHandle> {
        assert_eq!(
            vertex_buffers.len(),
            vertex_offsets.len(),
            "one offset per vertex buffer"
        );
        let pipelines = self.pipelines.lock();
        let Some(parent) = pipelines.get(pipeline) else {
            log::error!(
                "failed to add mesh under pipeline {:#x}; may indicate a stale pipeline handle",
                pipeline.uid()
            );
            return None;
        };
        let shader_objects = parent.shader_objects.lock();
        let Some(owner) = shader_objects.get(shader_object) else {
            log::error!(
                "failed to add mesh under shader object {:#x}; may indicate a stale shader object handle",
                shader_object.uid()
            );
            return None;
        };
        let uid = owner.mesh_uids.next();
        let result = owner.meshes.lock().insert(
            uid,
            Mesh {
                uid,
                vertex_buffers: vertex_buffers.to_vec(),
                vertex_offsets: vertex_offsets.to_vec(),
                index_buffer,
            },
        );
        Some(result)
    }

    pub fn remove_mesh(
        &self,
        pipeline: PipelineHandle,
        shader_object: ShaderObjectHandle,
        handle: MeshHandle,
    ) -> bool {
        let pipelines = self.pipelines.lock();
        let Some(parent) = pipelines.get(pipeline) else {
            log::error!(
                "failed to remove mesh {:#x}; may indicate a stale pipeline handle",
                handle.uid()
            );
            return false;
        };
        let shader_objects = parent.shader_objects.lock();
        let Some(owner) = shader_objects.get(shader_object) else {
            log::error!(
                "failed to remove mesh {:#x}; may indicate a stale shader object handle",
                handle.uid()
            );
            return false;
        };
        if owner.meshes.lock().remove(handle).is_none() {
            log::error!(
                "failed to remove mesh {:#x}; may indicate a stale mesh handle",
                handle.uid()
            );
            return false;
        }
        true
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.lock().len()
    }

    pub fn shader_object_count(&self, pipeline: PipelineHandle) -> Option<usize> {
        let pipelines = self.pipelines.lock();
        let result = pipelines.get(pipeline)?.shader_objects.lock().len();
        Some(result)
    }

    pub fn mesh_count(
        &self,
        pipeline: PipelineHandle,
        shader_object: ShaderObjectHandle,
    ) -> Option<usize> {
        let pipelines = self.pipelines.lock();
        let parent = pipelines.get(pipeline)?;
        let shader_objects = parent.shader_objects.lock();
        let result = shader_objects.get(shader_object)?.meshes.lock().len();
        Some(result)
    }

    /// Flattens this scope into `cmd`: one dynamic-rendering pass over the
    /// scope's attachments, binding each pipeline, its descriptor sets and
    /// its geometry buffers. Draw-call emission belongs to whoever filled
    /// those buffers.
    pub(crate) fn record(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        let color_infos: Vec<vk::RenderingAttachmentInfo> =
            self.color_attachments.iter().map(Attachment::to_vk).collect();
        let depth_info = self.depth_attachment.as_ref().map(Attachment::to_vk);
        let stencil_info = self.stencil_attachment.as_ref().map(Attachment::to_vk);

        let mut rendering_info = vk::RenderingInfo::builder()
            .render_area(self.render_area)
            .layer_count(1)
            .color_attachments(&color_infos);
        if let Some(info) = depth_info.as_ref() {
            rendering_info = rendering_info.depth_attachment(info);
        }
        if let Some(info) = stencil_info.as_ref() {
            rendering_info = rendering_info.stencil_attachment(info);
        }

        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);
        }

        let pipelines = self.pipelines.lock();
        for pipeline in pipelines.iter() {
            unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
            }
            let shader_objects = pipeline.shader_objects.lock();
            for shader_object in shader_objects.iter() {
                if !shader_object.descriptor_sets.is_empty() {
                    unsafe {
                        device.cmd_bind_descriptor_sets(
                            cmd,
                            vk::PipelineBindPoint::GRAPHICS,
                            pipeline.layout,
                            0,
                            &shader_object.descriptor_sets,
                            &[],
                        );
                    }
                }
                let meshes = shader_object.meshes.lock();
                for mesh in meshes.iter() {
                    if !mesh.vertex_buffers.is_empty() {
                        unsafe {
                            device.cmd_bind_vertex_buffers(
                                cmd,
                                0,
                                &mesh.vertex_buffers,
                                &mesh.vertex_offsets,
                            );
                        }
                    }
                    if mesh.index_buffer != vk::Buffer::null() {
                        unsafe {
                            device.cmd_bind_index_buffer(
                                cmd,
                                mesh.index_buffer,
                                0,
                                vk::IndexType::UINT32,
                            );
                        }
                    }
                }
            }
        }

        unsafe {
            device.cmd_end_rendering(cmd);
        }
    }
}

// ============================================================================
// Per-frame active list
// ============================================================================

/// Bounded list of contexts registered for the upcoming frame.
pub(crate) struct ActiveContexts {
    contexts: Mutex<Vec<Arc<RenderingContext>>>,
    capacity: usize,
}

impl ActiveContexts {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            contexts: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// `false` means the list is full and the context is dropped for this
    /// frame; the frame itself proceeds.
    pub(crate) fn push(&self, context: &Arc<RenderingContext>) -> bool {
        let mut contexts = self.contexts.lock();
        if contexts.len() >= self.capacity {
            return false;
        }
        contexts.push(context.clone());
        true
    }

    /// Removes the most recent registration of `context`, if any.
    pub(crate) fn pop(&self, context: &Arc<RenderingContext>) -> bool {
        let mut contexts = self.contexts.lock();
        if let Some(position) = contexts
            .iter()
            .rposition(|active| Arc::ptr_eq(active, context))
        {
            contexts.remove(position);
            return true;
        }
        false
    }

    /// Drains the list for flattening; registrations start over next frame.
    pub(crate) fn take(&self) -> Vec<Arc<RenderingContext>> {
        std::mem::take(&mut *self.contexts.lock())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.contexts.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_context() -> RenderingContext {
        RenderingContext::with_uid_seed(
            0xdead_beef_cafe_f00d,
            vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: 64,
                    height: 64,
                },
            },
            Vec::new(),
            None,
            None,
        )
    }

    #[test]
    fn context_types_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RenderingContext>();
        assert_send_sync::<ActiveContexts>();
    }

    #[test]
    fn add_then_remove_balances_counts() {
        let context = empty_context();
        let a = context.add_pipeline(vk::Pipeline::null(), vk::PipelineLayout::null());
        let b = context.add_pipeline(vk::Pipeline::null(), vk::PipelineLayout::null());
        assert_eq!(context.pipeline_count(), 2);
        assert!(context.remove_pipeline(a));
        assert_eq!(context.pipeline_count(), 1);
        assert!(context.remove_pipeline(b));
        assert_eq!(context.pipeline_count(), 0);
    }

    #[test]
    fn stale_handles_are_reported_not_fatal() {
        let context = empty_context();
        let pipeline = context.add_pipeline(vk::Pipeline::null(), vk::PipelineLayout::null());
        assert!(context.remove_pipeline(pipeline));
        assert!(!context.remove_pipeline(pipeline));

        // a recycled slot must not be reachable through the old handle
        let replacement = context.add_pipeline(vk::Pipeline::null(), vk::PipelineLayout::null());
        assert_ne!(pipeline, replacement);
        assert!(!context.remove_pipeline(pipeline));
        assert_eq!(context.pipeline_count(), 1);
    }

    #[test]
    fn nested_adds_resolve_through_handles() {
        let context = empty_context();
        let pipeline = context.add_pipeline(vk::Pipeline::null(), vk::PipelineLayout::null());
        let shader_object = context.add_shader_object(pipeline, &[]).unwrap();
        let mesh = context
            .add_mesh(pipeline, shader_object, &[], &[], vk::Buffer::null())
            .unwrap();
        assert_eq!(context.shader_object_count(pipeline), Some(1));
        assert_eq!(context.mesh_count(pipeline, shader_object), Some(1));
        assert!(context.remove_mesh(pipeline, shader_object, mesh));
        assert!(!context.remove_mesh(pipeline, shader_object, mesh));
        assert_eq!(context.mesh_count(pipeline, shader_object), Some(0));
    }

    #[test]
    fn removing_a_pipeline_invalidates_nested_handles() {
        let context = empty_context();
        let pipeline = context.add_pipeline(vk::Pipeline::null(), vk::PipelineLayout::null());
        let shader_object = context.add_shader_object(pipeline, &[]).unwrap();
        assert!(context.remove_pipeline(pipeline));
        assert!(context.add_shader_object(pipeline, &[]).is_none());
        assert!(!context.remove_shader_object(pipeline, shader_object));
    }

    #[test]
    fn uids_are_unique_per_parent() {
        let context = empty_context();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            let handle = context.add_pipeline(vk::Pipeline::null(), vk::PipelineLayout::null());
            assert!(seen.insert(handle.uid()));
        }
    }

    #[test]
    fn active_list_is_bounded() {
        let active = ActiveContexts::new(4);
        let context = Arc::new(empty_context());
        for _ in 0..4 {
            assert!(active.push(&context));
        }
        assert!(!active.push(&context));
        assert_eq!(active.len(), 4);
    }

    #[test]
    fn pop_removes_a_specific_registration() {
        let active = ActiveContexts::new(8);
        let a = Arc::new(empty_context());
        let b = Arc::new(empty_context());
        assert!(active.push(&a));
        assert!(active.push(&b));
        assert!(active.pop(&a));
        assert!(!active.pop(&a));
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn take_clears_the_registration_cycle() {
        let active = ActiveContexts::new(8);
        let context = Arc::new(empty_context());
        assert!(active.push(&context));
        assert_eq!(active.take().len(), 1);
        assert_eq!(active.len(), 0);
        // a new cycle starts empty and accepts registrations again
        assert!(active.push(&context));
    }
}
