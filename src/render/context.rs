//! GPU context for streaming textures using wgpu

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::{DeviceFailure, Error, PixelFormat, Result};
use crate::render::disposal::{DeferredDisposal, FrameFence};
use crate::render::gpu::{CommandRecorder, GpuBackend, ImageDesc, ImageLayout, MipRegion, Retired};

/// wgpu-backed implementation of [`GpuBackend`]
///
/// Layout transitions are tracked by wgpu itself, so recorded transitions are
/// only logged. Replaced handles are kept alive in a frame-fenced queue and
/// dropped once `Queue::on_submitted_work_done` reports their frames finished.
///
/// Every device call runs inside out-of-memory, validation and internal error
/// scopes, so wgpu errors come back as [`Error::Device`] instead of reaching
/// the uncaptured-error handler. Once the device is lost every call fails
/// with [`DeviceFailure::DeviceLost`].
pub struct WgpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    lost: Arc<AtomicBool>,
    fence: FrameFence,
    disposal: DeferredDisposal<Retired<WgpuContext>>,
}

impl WgpuContext {
    /// Wrap an existing device and queue
    ///
    /// Installs the device-lost callback; a callback set earlier is replaced.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            log::error!("Streaming device lost ({:?}): {}", reason, message);
            flag.store(true, Ordering::Release);
        });
        Self {
            device,
            queue,
            lost,
            fence: FrameFence::new(),
            disposal: DeferredDisposal::new(),
        }
    }

    /// Create a context without a surface (tools, offline cache warmers)
    pub async fn new_headless() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| {
                Error::Device(DeviceFailure::Other(format!("No suitable adapter found: {:?}", e)))
            })?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("rktri_texstream_device"),
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Device(DeviceFailure::Other(e.to_string())))?;

        log::info!("Streaming context on adapter: {}", adapter.get_info().name);
        Ok(Self::new(device, queue))
    }

    /// Blocking variant of [`WgpuContext::new_headless`]
    pub fn new_headless_blocking() -> Result<Self> {
        pollster::block_on(Self::new_headless())
    }

    /// Begin recording a frame; handles replaced from now on wait for it
    pub fn begin_frame(&self) -> u64 {
        self.fence.begin_frame()
    }

    /// Call after submitting the frame's command buffers
    pub fn end_frame(&self) {
        let frame = self.fence.current_frame();
        let completed = self.fence.completion_handle();
        self.queue.on_submitted_work_done(move || {
            completed.fetch_max(frame, Ordering::AcqRel);
        });
        self.collect_garbage();
    }

    /// Drop deferred handles whose frames have completed
    pub fn collect_garbage(&self) -> usize {
        let retired = self.disposal.collect(self.fence.completed_frame());
        let count = retired.len();
        if count > 0 {
            log::trace!("Released {} retired streaming objects", count);
        }
        count
    }

    pub fn fence(&self) -> &FrameFence {
        &self.fence
    }

    pub fn is_device_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Run `op` with wgpu errors captured and mapped to [`DeviceFailure`]
    ///
    /// Scopes are per thread and popped in reverse push order. A captured
    /// error takes precedence over what `op` returned.
    fn scoped<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.is_device_lost() {
            return Err(DeviceFailure::DeviceLost.into());
        }
        let out_of_memory = self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let validation = self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let internal = self.device.push_error_scope(wgpu::ErrorFilter::Internal);

        let result = op();

        let internal = pollster::block_on(internal.pop());
        let validation = pollster::block_on(validation.pop());
        let out_of_memory = pollster::block_on(out_of_memory.pop());
        if let Some(error) = out_of_memory.or(validation).or(internal) {
            return Err(device_failure(error).into());
        }
        if self.is_device_lost() {
            return Err(DeviceFailure::DeviceLost.into());
        }
        result
    }

    fn texture_format(format: PixelFormat) -> wgpu::TextureFormat {
        match format {
            PixelFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            PixelFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            PixelFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        }
    }
}

fn device_failure(error: wgpu::Error) -> DeviceFailure {
    match error {
        wgpu::Error::OutOfMemory { .. } => DeviceFailure::OutOfMemory,
        other => DeviceFailure::Other(other.to_string()),
    }
}

impl Drop for WgpuContext {
    fn drop(&mut self) {
        let _ = self.device.poll(wgpu::PollType::Wait { submission_index: None, timeout: None });
        self.disposal.drain_all();
    }
}

/// Queue-level uploads recorded for one single-time submission
struct WgpuRecorder<'a> {
    queue: &'a wgpu::Queue,
    copies: u32,
}

impl CommandRecorder<Arc<wgpu::Texture>> for WgpuRecorder<'_> {
    fn transition_mip_layout(
        &mut self,
        _image: &Arc<wgpu::Texture>,
        layout: ImageLayout,
        mip_level: u32,
    ) {
        log::trace!("mip {} -> {:?} (implicit in wgpu)", mip_level, layout);
    }

    fn copy_buffer_to_image_region(
        &mut self,
        image: &Arc<wgpu::Texture>,
        region: MipRegion,
        data: &[u8],
    ) {
        let bytes_per_row = data.len() as u32 / region.height.max(1);
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: image,
                mip_level: region.mip_level,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(region.height),
            },
            wgpu::Extent3d {
                width: region.width,
                height: region.height,
                depth_or_array_layers: 1,
            },
        );
        self.copies += 1;
    }
}

impl GpuBackend for WgpuContext {
    type Image = Arc<wgpu::Texture>;
    type View = Arc<wgpu::TextureView>;
    type Sampler = Arc<wgpu::Sampler>;

    fn create_image(&self, desc: &ImageDesc) -> Result<Self::Image> {
        self.scoped(|| {
            let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&desc.label),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: desc.mip_levels,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: Self::texture_format(desc.format),
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            Ok(Arc::new(texture))
        })
    }

    fn submit_single_time_command<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&mut dyn CommandRecorder<Self::Image>),
    {
        let copies = self.scoped(|| {
            let mut recorder = WgpuRecorder { queue: &self.queue, copies: 0 };
            record(&mut recorder);

            let index = self.queue.submit(std::iter::empty::<wgpu::CommandBuffer>());
            self.device
                .poll(wgpu::PollType::Wait { submission_index: Some(index), timeout: None })
                .map_err(|e| Error::Device(DeviceFailure::Other(e.to_string())))?;
            Ok(recorder.copies)
        })?;

        log::trace!("single-time submission finished ({} copies)", copies);
        Ok(())
    }

    fn create_image_view(
        &self,
        image: &Self::Image,
        base_mip: u32,
        mip_count: u32,
    ) -> Result<Self::View> {
        if mip_count == 0 || base_mip + mip_count > image.mip_level_count() {
            return Err(DeviceFailure::Other(format!(
                "view {}..{} exceeds {} mips",
                base_mip,
                base_mip + mip_count,
                image.mip_level_count()
            ))
            .into());
        }
        self.scoped(|| {
            let view = image.create_view(&wgpu::TextureViewDescriptor {
                label: Some("streaming_texture_view"),
                base_mip_level: base_mip,
                mip_level_count: Some(mip_count),
                ..Default::default()
            });
            Ok(Arc::new(view))
        })
    }

    fn create_sampler(&self, max_lod: f32) -> Result<Self::Sampler> {
        self.scoped(|| {
            let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some("streaming_texture_sampler"),
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                lod_min_clamp: 0.0,
                lod_max_clamp: max_lod,
                ..Default::default()
            });
            Ok(Arc::new(sampler))
        })
    }

    fn defer_disposal(&self, resource: Retired<Self>) {
        self.disposal.defer(resource, &self.fence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(width: u32, height: u32, mip_levels: u32) -> ImageDesc {
        ImageDesc {
            label: "test".to_string(),
            width,
            height,
            mip_levels,
            format: PixelFormat::Rgba8Unorm,
        }
    }

    #[test]
    fn test_device_failure_mapping() {
        let oom = wgpu::Error::OutOfMemory { source: Box::new(std::io::Error::other("heap")) };
        assert_eq!(device_failure(oom), DeviceFailure::OutOfMemory);

        let validation = wgpu::Error::Validation {
            source: Box::new(std::io::Error::other("bad")),
            description: "texture size is zero".to_string(),
        };
        assert_eq!(
            device_failure(validation),
            DeviceFailure::Other("texture size is zero".to_string())
        );
    }

    // Skipped on machines without an adapter

    #[test]
    fn test_invalid_image_is_device_error() {
        let Ok(ctx) = WgpuContext::new_headless_blocking() else {
            return;
        };
        let result = ctx.create_image(&desc(0, 0, 1));
        assert!(matches!(result, Err(Error::Device(DeviceFailure::Other(_)))));

        // The context stays usable
        let image = ctx.create_image(&desc(16, 16, 5)).unwrap();
        assert!(ctx.create_image_view(&image, 4, 1).is_ok());
        assert!(matches!(ctx.create_image_view(&image, 4, 2), Err(Error::Device(_))));
    }

    #[test]
    fn test_short_upload_is_device_error() {
        let Ok(ctx) = WgpuContext::new_headless_blocking() else {
            return;
        };
        let image = ctx.create_image(&desc(4, 4, 3)).unwrap();
        let region = MipRegion { mip_level: 0, width: 4, height: 4 };
        let result = ctx.submit_single_time_command(|cmd| {
            cmd.copy_buffer_to_image_region(&image, region, &[0u8; 8]);
        });
        assert!(matches!(result, Err(Error::Device(DeviceFailure::Other(_)))));
    }

    #[test]
    fn test_lost_device_fails_every_call() {
        let Ok(ctx) = WgpuContext::new_headless_blocking() else {
            return;
        };
        ctx.lost.store(true, Ordering::Release);
        assert!(ctx.is_device_lost());
        assert!(matches!(
            ctx.create_image(&desc(16, 16, 5)),
            Err(Error::Device(DeviceFailure::DeviceLost))
        ));
        assert!(matches!(
            ctx.create_sampler(1.0),
            Err(Error::Device(DeviceFailure::DeviceLost))
        ));
    }
}
