// 该文件是 Shiye （视野） 项目的一部分。
// src/model/dispatcher.rs - 模型变体分发
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info};

use super::{
  BACKEND_THRESHOLDS, BackendError, BackendLoader, DetectionBackend, InferenceResult,
  ModelVariant, PlatformCapabilities, SegmentationBackend, SupportedVariant, Task, Thresholds,
};
use crate::frame::PixelBuffer;

#[derive(Error, Debug)]
pub enum DispatchError {
  #[error("不支持的模型配置 {variant}: {reason}")]
  UnsupportedConfiguration {
    variant: ModelVariant,
    reason: &'static str,
  },
  #[error("模型 {variant} 加载失败: {source}")]
  LoadFailed {
    variant: ModelVariant,
    #[source]
    source: BackendError,
  },
  #[error("推理失败: {0}")]
  InferenceFailed(#[source] BackendError),
}

enum LoadedModel {
  DetectionNano(Box<dyn DetectionBackend>),
  DetectionSmall(Box<dyn DetectionBackend>),
  SegmentationNano(Box<dyn SegmentationBackend>),
  SegmentationSmall(Box<dyn SegmentationBackend>),
}

impl LoadedModel {
  fn predict(
    &self,
    image: &PixelBuffer,
    thresholds: Thresholds,
  ) -> Result<InferenceResult, BackendError> {
    match self {
      LoadedModel::DetectionNano(backend) | LoadedModel::DetectionSmall(backend) => {
        Ok(InferenceResult {
          primary: backend.predict(image, thresholds)?,
          auxiliary: None,
        })
      }
      LoadedModel::SegmentationNano(backend) | LoadedModel::SegmentationSmall(backend) => {
        let (primary, proto) = backend.predict(image)?;
        Ok(InferenceResult {
          primary,
          auxiliary: Some(proto),
        })
      }
    }
  }
}

/// 按 (任务, 权重) 分发到推理后端
///
/// 后端在首次使用时加载，之后常驻，不做淘汰。
pub struct ModelDispatcher {
  loader: Box<dyn BackendLoader>,
  capabilities: PlatformCapabilities,
  loaded: HashMap<SupportedVariant, LoadedModel>,
}

impl ModelDispatcher {
  pub fn new(loader: Box<dyn BackendLoader>) -> Self {
    Self {
      loader,
      capabilities: PlatformCapabilities::default(),
      loaded: HashMap::new(),
    }
  }

  pub fn with_capabilities(mut self, capabilities: PlatformCapabilities) -> Self {
    self.capabilities = capabilities;
    self
  }

  /// 校验变体是否受支持，不触碰任何后端
  pub fn resolve(&self, variant: ModelVariant) -> Result<SupportedVariant, DispatchError> {
    let supported =
      SupportedVariant::resolve(variant).ok_or(DispatchError::UnsupportedConfiguration {
        variant,
        reason: "该任务与权重组合没有实现",
      })?;

    if variant.task == Task::Segmentation && !self.capabilities.segmentation {
      return Err(DispatchError::UnsupportedConfiguration {
        variant,
        reason: "当前平台不支持分割模型",
      });
    }

    Ok(supported)
  }

  pub fn is_loaded(&self, variant: ModelVariant) -> bool {
    SupportedVariant::resolve(variant)
      .map(|supported| self.loaded.contains_key(&supported))
      .unwrap_or(false)
  }

  /// 实例化变体对应的后端，已加载时直接返回
  pub fn load(&mut self, variant: ModelVariant) -> Result<(), DispatchError> {
    let supported = self.resolve(variant)?;
    if self.loaded.contains_key(&supported) {
      debug!("模型 {} 已加载", variant);
      return Ok(());
    }

    info!("加载模型 {} ({})", variant, supported.model_name());
    let failed = |source: BackendError| DispatchError::LoadFailed { variant, source };
    let model = match supported {
      SupportedVariant::DetectionNano => {
        LoadedModel::DetectionNano(self.loader.load_detection(supported).map_err(failed)?)
      }
      SupportedVariant::DetectionSmall => {
        LoadedModel::DetectionSmall(self.loader.load_detection(supported).map_err(failed)?)
      }
      SupportedVariant::SegmentationNano => {
        LoadedModel::SegmentationNano(self.loader.load_segmentation(supported).map_err(failed)?)
      }
      SupportedVariant::SegmentationSmall => LoadedModel::SegmentationSmall(
        self
          .loader
          .load_segmentation(supported)
          .map_err(failed)?,
      ),
    };
    self.loaded.insert(supported, model);
    info!("模型 {} 加载完成", variant);
    Ok(())
  }

  /// 对一帧执行推理，返回统一形状的结果
  pub fn predict(
    &mut self,
    variant: ModelVariant,
    image: &PixelBuffer,
  ) -> Result<InferenceResult, DispatchError> {
    let supported = self.resolve(variant)?;
    if !self.loaded.contains_key(&supported) {
      self.load(variant)?;
    }

    let Some(model) = self.loaded.get(&supported) else {
      return Err(DispatchError::UnsupportedConfiguration {
        variant,
        reason: "模型未加载",
      });
    };

    model
      .predict(image, BACKEND_THRESHOLDS)
      .map_err(DispatchError::InferenceFailed)
  }
}
