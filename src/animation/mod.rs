//! 动画系统
//!
//! VMD 动画解析、关键帧轨道求值、VPD 姿势

pub mod bezier_curve;
pub mod keyframe;
pub mod motion;
pub mod motion_track;
pub mod vmd_loader;
pub mod vpd_file;

pub use bezier_curve::{Curve, VmdBezier};
pub use keyframe::{
    BoneKeyframe, CameraKeyframe, IkKeyframe, Keyframe, LightKeyframe, MorphKeyframe, ShadowKeyframe,
};
pub use motion::Motion;
pub use motion_track::{
    BoneFrameTransform, BoneMotionTrack, IkMotionTrack, KeyframeTrack, MorphMotionTrack, MotionTrack,
};
pub use vmd_loader::{VmdAnimation, VmdFile};
pub use vpd_file::{VpdBone, VpdFile, VpdMorph};
