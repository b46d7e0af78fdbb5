//! Device-side scrambling engine.
//!
//! Owns the wgpu device, the per-image textures and the instruction-map
//! cache, and encodes the staged work the scheduler drives: upload, one or
//! more compute passes over ping-ponged targets, transfer into a
//! host-readable buffer, submit, readback.

use std::collections::HashMap;
use std::sync::mpsc;

use anyhow::{anyhow, Result};
use image::DynamicImage;

use crate::config::{CipherMode, RenderConfig};
use crate::errors::RenderError;
use crate::layout::{DeviceFormat, PixelLayout};
use crate::lookup::{build_instruction_map, LookupTableSpec};

// One source per pixel-format variant; the storage-texture format is the
// only line that differs, so it is substituted at setup.
//
// Both kernels gather: the instruction at an output pixel names the source
// pixel. The direction byte carries the sign quadrant in its low two bits
// and `cluster_size - 1` above them, and displacements are stored in
// cluster units, so decoding scales them back to pixels.
const KERNEL_SHADER_TEMPLATE: &str = r#"
@group(0) @binding(0) var src_tex: texture_2d<f32>;
@group(0) @binding(1) var map_tex: texture_2d<u32>;
@group(0) @binding(2) var dst_tex: texture_storage_2d<{{storage_format}}, write>;

@compute @workgroup_size(16, 16, 1)
fn permute_main(@builtin(global_invocation_id) gid: vec3<u32>) {
  let dims = textureDimensions(src_tex);
  if (gid.x >= dims.x || gid.y >= dims.y) {
    return;
  }
  let coord = vec2<i32>(i32(gid.x), i32(gid.y));
  let inst = textureLoad(map_tex, coord, 0);
  let cluster = i32(inst.z / 4u) + 1;
  let quadrant = inst.z % 4u;
  var dx = i32(inst.x) * cluster;
  var dy = i32(inst.y) * cluster;
  if (quadrant == 1u || quadrant == 3u) {
    dx = -dx;
  }
  if (quadrant == 2u || quadrant == 3u) {
    dy = -dy;
  }
  let source = textureLoad(src_tex, coord + vec2<i32>(dx, dy), 0);
  textureStore(dst_tex, coord, source);
}

@compute @workgroup_size(16, 16, 1)
fn substitute_main(@builtin(global_invocation_id) gid: vec3<u32>) {
  let dims = textureDimensions(src_tex);
  if (gid.x >= dims.x || gid.y >= dims.y) {
    return;
  }
  let coord = vec2<i32>(i32(gid.x), i32(gid.y));
  let inst = textureLoad(map_tex, coord, 0);
  let pixel = textureLoad(src_tex, coord, 0);
  let quantized = vec4<u32>(round(clamp(pixel, vec4<f32>(0.0), vec4<f32>(1.0)) * 255.0));
  let mixed = (quantized ^ inst) & vec4<u32>(255u);
  textureStore(dst_tex, coord, vec4<f32>(mixed) / 255.0);
}
"#;

const WORKGROUP_SIZE: u32 = 16;

struct KernelSet {
    bind_group_layout: wgpu::BindGroupLayout,
    permutation: wgpu::ComputePipeline,
    substitution: wgpu::ComputePipeline,
}

struct GpuEnvironment {
    device: wgpu::Device,
    queue: wgpu::Queue,
    rgba8_kernels: KernelSet,
    rgba32f_kernels: KernelSet,
}

impl GpuEnvironment {
    fn kernels_for(&self, format: DeviceFormat) -> &KernelSet {
        match format {
            DeviceFormat::Rgba8Unorm => &self.rgba8_kernels,
            DeviceFormat::Rgba32Float => &self.rgba32f_kernels,
        }
    }
}

struct LoadedImage {
    layout: PixelLayout,
    source: wgpu::Texture,
    /// Ping-pong compute targets, indexed by pass parity.
    targets: [wgpu::Texture; 2],
    readback: wgpu::Buffer,
    padded_bytes_per_row: u32,
}

#[derive(Default)]
pub struct ComputeEngine {
    environment: Option<GpuEnvironment>,
    image: Option<LoadedImage>,
    lookup_cache: HashMap<LookupTableSpec, wgpu::Texture>,
    pending: Vec<(wgpu::CommandBuffer, &'static str)>,
}

impl ComputeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the device and compile both kernel variants. A second call
    /// on a live environment is a no-op.
    pub async fn setup(&mut self) -> Result<()> {
        if self.environment.is_some() {
            return Ok(());
        }

        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or(RenderError::EnvironmentUnavailable(
                "no compatible GPU adapter found".to_owned(),
            ))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("pxscramble-device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|error| RenderError::EnvironmentUnavailable(error.to_string()))?;

        let rgba8_kernels = build_kernel_set(&device, DeviceFormat::Rgba8Unorm);
        let rgba32f_kernels = build_kernel_set(&device, DeviceFormat::Rgba32Float);

        self.environment = Some(GpuEnvironment {
            device,
            queue,
            rgba8_kernels,
            rgba32f_kernels,
        });
        Ok(())
    }

    /// Allocate the per-run textures and upload the source image.
    pub fn load_image(&mut self, image: &DynamicImage, layout: PixelLayout) -> Result<()> {
        let env = self
            .environment
            .as_ref()
            .ok_or_else(|| anyhow!("image loaded before the environment was set up"))?;

        let extent = wgpu::Extent3d {
            width: layout.width,
            height: layout.height,
            depth_or_array_layers: 1,
        };
        let format = layout.device_format().wgpu_format();

        let target_descriptor = wgpu::TextureDescriptor {
            label: Some("pxscramble-target"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::STORAGE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        };
        let targets = [
            env.device.create_texture(&target_descriptor),
            env.device.create_texture(&target_descriptor),
        ];

        let unpadded_bytes_per_row = layout
            .width
            .checked_mul(layout.device_format().bytes_per_pixel())
            .ok_or_else(|| RenderError::UploadFailed("image row size overflow".to_owned()))?;
        let padded_bytes_per_row =
            align_to(unpadded_bytes_per_row, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let readback = env.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("pxscramble-readback"),
            size: u64::from(padded_bytes_per_row) * u64::from(layout.height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let source = env.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("pxscramble-source"),
            size: extent,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let bytes = layout.upload_bytes(image);
        let expected = u64::from(unpadded_bytes_per_row) * u64::from(layout.height);
        if bytes.len() as u64 != expected {
            return Err(RenderError::UploadFailed(format!(
                "expected {expected} source bytes, prepared {}",
                bytes.len()
            ))
            .into());
        }
        env.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &source,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &bytes,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(unpadded_bytes_per_row),
                rows_per_image: Some(layout.height),
            },
            extent,
        );

        self.image = Some(LoadedImage {
            layout,
            source,
            targets,
            readback,
            padded_bytes_per_row,
        });
        Ok(())
    }

    /// Encode one compute pass. `pass_index` selects the ping-pong pair:
    /// pass 0 reads the source; pass `n > 0` reads the target pass `n - 1`
    /// wrote.
    pub fn compute_pass(&mut self, config: &RenderConfig, pass_index: u32) -> Result<()> {
        let env = self
            .environment
            .as_ref()
            .ok_or_else(|| anyhow!("compute pass before environment setup"))?;
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| anyhow!("compute pass before image load"))?;

        let spec = LookupTableSpec::new(image.layout.width, image.layout.height, config);
        if !self.lookup_cache.contains_key(&spec) {
            let map = build_instruction_map(&spec)?;
            let texture = upload_instruction_map(env, &spec, &map);
            self.lookup_cache.insert(spec.clone(), texture);
        }
        let lookup_texture = &self.lookup_cache[&spec];

        let kernels = env.kernels_for(image.layout.device_format());
        let pipeline = match config.cipher_mode {
            CipherMode::Permutation | CipherMode::Unpermutation => &kernels.permutation,
            CipherMode::Substitution => &kernels.substitution,
        };

        let (input, output) = if pass_index == 0 {
            (&image.source, &image.targets[0])
        } else {
            (
                &image.targets[(pass_index as usize - 1) % 2],
                &image.targets[pass_index as usize % 2],
            )
        };

        let input_view = input.create_view(&wgpu::TextureViewDescriptor::default());
        let lookup_view = lookup_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let output_view = output.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = env.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("pxscramble-pass-bind-group"),
            layout: &kernels.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&input_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&lookup_view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&output_view),
                },
            ],
        });

        let mut encoder = env
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("pxscramble-compute-encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("pxscramble-compute-pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(
                (image.layout.width + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE,
                (image.layout.height + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE,
                1,
            );
        }
        self.pending.push((encoder.finish(), "compute"));
        Ok(())
    }

    /// Encode the copy of the last-written target into the readback buffer.
    pub fn transfer(&mut self, pass_count: u32) -> Result<()> {
        let env = self
            .environment
            .as_ref()
            .ok_or_else(|| anyhow!("transfer before environment setup"))?;
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| anyhow!("transfer before image load"))?;
        if pass_count == 0 {
            return Err(anyhow!("transfer before any compute pass"));
        }

        let written = &image.targets[(pass_count as usize - 1) % 2];
        let mut encoder = env
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("pxscramble-transfer-encoder"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: written,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &image.readback,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(image.padded_bytes_per_row),
                    rows_per_image: Some(image.layout.height),
                },
            },
            wgpu::Extent3d {
                width: image.layout.width,
                height: image.layout.height,
                depth_or_array_layers: 1,
            },
        );
        self.pending.push((encoder.finish(), "transfer"));
        Ok(())
    }

    /// Submit every queued command buffer, in queue order. Returns the unit
    /// labels so the caller can report completions once the queue drains.
    pub fn commit(&mut self) -> Result<Vec<&'static str>> {
        let env = self
            .environment
            .as_ref()
            .ok_or_else(|| anyhow!("commit before environment setup"))?;
        let (buffers, labels): (Vec<_>, Vec<_>) = self.pending.drain(..).unzip();
        env.queue.submit(buffers);
        Ok(labels)
    }

    /// Map the readback buffer and rebuild a host image in the source depth.
    pub fn read_output(&self) -> Result<DynamicImage> {
        let env = self
            .environment
            .as_ref()
            .ok_or_else(|| anyhow!("readback before environment setup"))?;
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| anyhow!("readback before image load"))?;

        let buffer_slice = image.readback.slice(..);
        let (sender, receiver) = mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        env.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| RenderError::TransferFailed("map callback dropped".to_owned()))?
            .map_err(|error| RenderError::TransferFailed(error.to_string()))?;

        let unpadded = image.layout.device_bytes_per_row() as usize;
        let padded = image.padded_bytes_per_row as usize;
        let mapped = buffer_slice.get_mapped_range();
        let mut bytes = vec![0_u8; unpadded * image.layout.height as usize];
        for (row, chunk) in mapped
            .chunks(padded)
            .take(image.layout.height as usize)
            .enumerate()
        {
            bytes[row * unpadded..(row + 1) * unpadded].copy_from_slice(&chunk[..unpadded]);
        }
        drop(mapped);
        image.readback.unmap();

        Ok(image.layout.image_from_device_bytes(bytes)?)
    }

    pub fn loaded_layout(&self) -> Option<PixelLayout> {
        self.image.as_ref().map(|image| image.layout)
    }

    pub fn cached_lookup_tables(&self) -> usize {
        self.lookup_cache.len()
    }

    /// Drop per-run state but retain the instruction-map cache and the
    /// device environment.
    pub fn flush(&mut self) {
        self.pending.clear();
        self.image = None;
    }

    /// Drop everything, including the cache and the device.
    pub fn reset(&mut self) {
        self.flush();
        self.lookup_cache.clear();
        self.environment = None;
    }
}

fn build_kernel_set(device: &wgpu::Device, format: DeviceFormat) -> KernelSet {
    let label = format.wgsl_storage_format();
    let source = KERNEL_SHADER_TEMPLATE.replace("{{storage_format}}", format.wgsl_storage_format());
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });

    let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Uint,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::StorageTexture {
                    access: wgpu::StorageTextureAccess::WriteOnly,
                    format: format.wgpu_format(),
                    view_dimension: wgpu::TextureViewDimension::D2,
                },
                count: None,
            },
        ],
    });

    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[&bind_group_layout],
        push_constant_ranges: &[],
    });
    let permutation = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some("pxscramble-permutation"),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point: "permute_main",
        compilation_options: wgpu::PipelineCompilationOptions::default(),
    });
    let substitution = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some("pxscramble-substitution"),
        layout: Some(&pipeline_layout),
        module: &shader,
        entry_point: "substitute_main",
        compilation_options: wgpu::PipelineCompilationOptions::default(),
    });

    KernelSet {
        bind_group_layout,
        permutation,
        substitution,
    }
}

fn upload_instruction_map(
    env: &GpuEnvironment,
    spec: &LookupTableSpec,
    map: &[u8],
) -> wgpu::Texture {
    let extent = wgpu::Extent3d {
        width: spec.width,
        height: spec.height,
        depth_or_array_layers: 1,
    };
    let texture = env.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("pxscramble-instruction-map"),
        size: extent,
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8Uint,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    env.queue.write_texture(
        wgpu::ImageCopyTexture {
            texture: &texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        map,
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(spec.width * 4),
            rows_per_image: Some(spec.height),
        },
        extent,
    );
    texture
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}
